// Port configuration
pub const DEFAULT_PORT: u16 = 3001;

// Initial map view
pub const DEFAULT_MAP_STYLE: &str = "mapbox://styles/0xmohamed/cm94r6wns00b801r0b1dtceh7";
pub const DEFAULT_CENTER: [f64; 2] = [108.6, 32.2];
pub const DEFAULT_ZOOM: f64 = 1.06;

// Camera flights
pub const ARRIVAL_TOLERANCE: f64 = 0.00001; // degrees, per axis
pub const FLY_SPEED: f64 = 0.6;
pub const FLY_CURVE: f64 = 1.5;
pub const SETTLE_DELAY_MS: u64 = 100; // pause between stopping a flight and starting the next
pub const FRAME_INTERVAL_MS: u64 = 16;
pub const MAX_FLIGHT_SECS: f64 = 60.0;

// Accepted camera ranges
pub const MIN_ZOOM: f64 = 0.0;
pub const MAX_ZOOM: f64 = 24.0;
pub const MIN_PITCH: f64 = 0.0;
pub const MAX_PITCH: f64 = 85.0;

// Marker pulse
pub const PULSE_FRAMES_PER_CYCLE: f64 = 300.0;
pub const PULSE_MAX_RADIUS: f64 = 25.0;
pub const PULSE_INITIAL_RADIUS: f64 = 5.0;
pub const PULSE_INITIAL_OPACITY: f64 = 1.0;
pub const PULSE_FADE: f64 = 0.9; // opacity lost over one frame budget

// Rendering layer ids
pub const TOWER_SOURCE_ID: &str = "towerPoints";
pub const PULSE_LAYER_ID: &str = "dot";
pub const DOT_LAYER_ID: &str = "dot-1";
pub const PIN_LAYER_ID: &str = "towersPin";

// Icons are normalised to fit this box before being served
pub const ICON_SIZE: u32 = 64;
pub const ICON_FETCH_TIMEOUT_SECS: u64 = 10;
