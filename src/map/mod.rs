pub mod arrival;
pub mod camera;
pub mod icons;
pub mod pulse;
pub mod style;

pub use arrival::ArrivalWatcher;
pub use camera::CameraEngine;
pub use icons::IconRegistry;
pub use pulse::PulseAnimator;
pub use style::{MapStyle, PaintTarget};
