use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::constants::{
    DEFAULT_CENTER, DEFAULT_ZOOM, FLY_CURVE, FLY_SPEED, MAX_FLIGHT_SECS, MAX_PITCH, MAX_ZOOM,
    MIN_PITCH, MIN_ZOOM,
};

/// A longitude/latitude pair, serialised GeoJSON-style as `[lng, lat]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct LngLat {
    pub lng: f64,
    pub lat: f64,
}

impl LngLat {
    pub const fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }

    pub fn is_valid(&self) -> bool {
        self.lng.is_finite()
            && self.lat.is_finite()
            && (-180.0..=180.0).contains(&self.lng)
            && (-90.0..=90.0).contains(&self.lat)
    }

    /// True when both axes differ from `other` by strictly less than `tolerance` degrees.
    pub fn within(&self, other: &LngLat, tolerance: f64) -> bool {
        (self.lng - other.lng).abs() < tolerance && (self.lat - other.lat).abs() < tolerance
    }
}

impl From<[f64; 2]> for LngLat {
    fn from(pair: [f64; 2]) -> Self {
        Self::new(pair[0], pair[1])
    }
}

impl From<LngLat> for [f64; 2] {
    fn from(point: LngLat) -> Self {
        [point.lng, point.lat]
    }
}

/// Rejects zoom and pitch values the map cannot show.
pub fn check_view_angles(zoom: f64, pitch: f64, bearing: f64) -> Result<()> {
    ensure!(
        (MIN_ZOOM..=MAX_ZOOM).contains(&zoom),
        "Zoom {} outside {}..={}",
        zoom,
        MIN_ZOOM,
        MAX_ZOOM
    );
    ensure!(
        (MIN_PITCH..=MAX_PITCH).contains(&pitch),
        "Pitch {} outside {}..={}",
        pitch,
        MIN_PITCH,
        MAX_PITCH
    );
    ensure!(bearing.is_finite(), "Bearing must be finite");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraState {
    pub center: LngLat,
    pub zoom: f64,
    pub pitch: f64,
    pub bearing: f64,
}

impl CameraState {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.center.is_valid(),
            "Camera center out of range: [{}, {}]",
            self.center.lng,
            self.center.lat
        );
        check_view_angles(self.zoom, self.pitch, self.bearing)
    }
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            center: LngLat::from(DEFAULT_CENTER),
            zoom: DEFAULT_ZOOM,
            pitch: 0.0,
            bearing: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Easing {
    Linear,
    /// `t * (2 - t)`: fast start, gentle landing.
    EaseOutQuad,
}

impl Easing {
    pub fn apply(self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Easing::Linear => t,
            Easing::EaseOutQuad => t * (2.0 - t),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlyToOptions {
    pub center: LngLat,
    pub zoom: f64,
    pub pitch: f64,
    pub bearing: f64,
    pub speed: f64,
    pub curve: f64,
    pub easing: Easing,
}

impl FlyToOptions {
    pub fn to(center: LngLat, zoom: f64, pitch: f64, bearing: f64) -> Self {
        Self {
            center,
            zoom,
            pitch,
            bearing,
            speed: FLY_SPEED,
            curve: FLY_CURVE,
            easing: Easing::EaseOutQuad,
        }
    }

    fn target(&self) -> CameraState {
        CameraState {
            center: self.center,
            zoom: self.zoom,
            pitch: self.pitch,
            bearing: self.bearing,
        }
    }

    /// Flight length grows with distance travelled and zoom change, scaled by curve over speed.
    /// Never longer than `MAX_FLIGHT_SECS`.
    pub fn duration_from(&self, start: &CameraState) -> Duration {
        let travel = (self.center.lng - start.center.lng).hypot(self.center.lat - start.center.lat);
        let zoom_change = (self.zoom - start.zoom).abs();
        let speed = if self.speed > 0.0 { self.speed } else { FLY_SPEED };
        let curve = self.curve.max(1.0);
        let secs = (0.4 + travel / 60.0 + zoom_change / 10.0) * curve / speed;
        Duration::try_from_secs_f64(secs.min(MAX_FLIGHT_SECS))
            .unwrap_or(Duration::from_secs_f64(MAX_FLIGHT_SECS))
    }

    /// Camera at progress `t` in [0, 1]; `t == 1` lands exactly on the target.
    pub fn interpolate(&self, start: &CameraState, t: f64) -> CameraState {
        if t >= 1.0 {
            return self.target();
        }
        let e = self.easing.apply(t);
        let lerp = |a: f64, b: f64| a + (b - a) * e;

        // Zoom out mid-flight; the arc vanishes at both ends
        let travel = (self.center.lng - start.center.lng).hypot(self.center.lat - start.center.lat);
        let arc = 4.0 * e * (1.0 - e) * (self.curve - 1.0).max(0.0) * (travel / 30.0).min(4.0);

        CameraState {
            center: LngLat::new(
                lerp(start.center.lng, self.center.lng),
                lerp(start.center.lat, self.center.lat),
            ),
            zoom: (lerp(start.zoom, self.zoom) - arc).max(0.0),
            pitch: lerp(start.pitch, self.pitch),
            bearing: lerp(start.bearing, self.bearing),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(u64);

pub type MoveListener = Box<dyn FnMut(&CameraState) + Send>;

/// Source of camera movement notifications.
pub trait CameraObserver: Send + Sync {
    fn camera(&self) -> CameraState;
    fn subscribe(&self, listener: MoveListener) -> SubscriptionHandle;
    /// Returns false when the handle was not subscribed.
    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool;
}

#[derive(Default)]
struct ListenerTable {
    next_handle: u64,
    entries: Vec<(SubscriptionHandle, MoveListener)>,
    dispatching: Vec<SubscriptionHandle>,
    cancelled: HashSet<SubscriptionHandle>,
}

/// Ordered listener list. Listeners run outside the table lock, so they may
/// unsubscribe themselves (or others); a cancelled listener is skipped for the
/// rest of the current notification and dropped afterwards.
#[derive(Default)]
pub struct MoveNotifier {
    table: Mutex<ListenerTable>,
    dispatch: Mutex<()>,
}

impl MoveNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: MoveListener) -> SubscriptionHandle {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.next_handle += 1;
        let handle = SubscriptionHandle(table.next_handle);
        table.entries.push((handle, listener));
        handle
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = table.entries.iter().position(|(h, _)| *h == handle) {
            let removed = table.entries.remove(index);
            // Drop the listener (and whatever it captured) outside the lock
            drop(table);
            drop(removed);
            return true;
        }
        if table.dispatching.contains(&handle) {
            return table.cancelled.insert(handle);
        }
        false
    }

    #[cfg(test)]
    pub fn listener_count(&self) -> usize {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.entries.len() + table.dispatching.len() - table.cancelled.len()
    }

    pub fn notify(&self, camera: &CameraState) {
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);

        let mut active = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            let active = std::mem::take(&mut table.entries);
            table.dispatching = active.iter().map(|(h, _)| *h).collect();
            active
        };

        for (handle, listener) in active.iter_mut() {
            let cancelled = self
                .table
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .cancelled
                .contains(handle);
            if !cancelled {
                listener(camera);
            }
        }

        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let cancelled = std::mem::take(&mut table.cancelled);
        active.retain(|(h, _)| !cancelled.contains(h));
        // Listeners subscribed during dispatch go after the existing ones
        active.append(&mut table.entries);
        table.entries = active;
        table.dispatching.clear();
    }
}

struct Flight {
    id: u64,
    task: JoinHandle<()>,
}

/// Headless camera: animates fly-to transitions on a frame tick and reports every
/// intermediate position to its subscribers.
pub struct CameraEngine {
    state: Mutex<CameraState>,
    notifier: MoveNotifier,
    flight: Mutex<Option<Flight>>,
    flight_ids: AtomicU64,
    frame_interval: Duration,
}

impl CameraEngine {
    pub fn new(initial: CameraState, frame_interval: Duration) -> Self {
        Self {
            state: Mutex::new(initial),
            notifier: MoveNotifier::new(),
            flight: Mutex::new(None),
            flight_ids: AtomicU64::new(0),
            frame_interval,
        }
    }

    #[cfg(test)]
    pub fn is_flying(&self) -> bool {
        self.flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |flight| !flight.task.is_finished())
    }

    /// Starts a flight from the current camera, replacing any flight in progress.
    /// Must be called from within a tokio runtime.
    pub fn fly_to(self: &Arc<Self>, options: FlyToOptions) {
        self.stop();

        let start = self.camera();
        let duration = options.duration_from(&start);
        let id = self.flight_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let engine = Arc::clone(self);

        tracing::debug!(
            "✈️  Flight {} to [{}, {}] over {:?}",
            id,
            options.center.lng,
            options.center.lat,
            duration
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.frame_interval);
            let began = Instant::now();
            loop {
                ticker.tick().await;
                let t = if duration.is_zero() {
                    1.0
                } else {
                    began.elapsed().as_secs_f64() / duration.as_secs_f64()
                };
                let camera = options.interpolate(&start, t);
                engine.apply(camera);
                if t >= 1.0 {
                    break;
                }
            }
        });

        let mut flight = self.flight.lock().unwrap_or_else(PoisonError::into_inner);
        *flight = Some(Flight { id, task });
    }

    /// Halts the flight in progress where it is. Returns true if one was running.
    pub fn stop(&self) -> bool {
        let previous = self.flight.lock().unwrap_or_else(PoisonError::into_inner).take();
        match previous {
            Some(flight) if !flight.task.is_finished() => {
                flight.task.abort();
                tracing::debug!("🛑 Flight {} stopped", flight.id);
                true
            }
            _ => false,
        }
    }

    /// Moves the camera immediately, cancelling any flight.
    pub fn jump_to(&self, camera: CameraState) {
        self.stop();
        self.apply(camera);
    }

    fn apply(&self, camera: CameraState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = camera;
        self.notifier.notify(&camera);
    }

    #[cfg(test)]
    pub fn listener_count(&self) -> usize {
        self.notifier.listener_count()
    }
}

impl CameraObserver for CameraEngine {
    fn camera(&self) -> CameraState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self, listener: MoveListener) -> SubscriptionHandle {
        self.notifier.subscribe(listener)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.notifier.unsubscribe(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn at(lng: f64, lat: f64) -> CameraState {
        CameraState {
            center: LngLat::new(lng, lat),
            ..CameraState::default()
        }
    }

    #[test]
    fn lnglat_serialises_as_pair() {
        let json = serde_json::to_string(&LngLat::new(2.29, 48.86)).unwrap();
        assert_eq!(json, "[2.29,48.86]");
        let back: LngLat = serde_json::from_str("[-73.98, 40.75]").unwrap();
        assert_eq!(back, LngLat::new(-73.98, 40.75));
    }

    #[test]
    fn validity_checks_ranges() {
        assert!(LngLat::new(180.0, -90.0).is_valid());
        assert!(!LngLat::new(180.5, 0.0).is_valid());
        assert!(!LngLat::new(0.0, 91.0).is_valid());
        assert!(!LngLat::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn ease_out_quad_matches_curve() {
        assert_eq!(Easing::EaseOutQuad.apply(0.0), 0.0);
        assert_eq!(Easing::EaseOutQuad.apply(0.5), 0.75);
        assert_eq!(Easing::EaseOutQuad.apply(1.0), 1.0);
        assert_eq!(Easing::EaseOutQuad.apply(3.0), 1.0);
    }

    #[test]
    fn interpolation_lands_exactly_on_target() {
        let start = CameraState::default();
        let options = FlyToOptions::to(LngLat::new(2.2945245246351655, 48.85824690254192), 15.9, 65.0, -11.2);
        let landed = options.interpolate(&start, 1.0);
        assert_eq!(landed.center, options.center);
        assert_eq!(landed.zoom, 15.9);
        assert_eq!(landed.pitch, 65.0);

        let midway = options.interpolate(&start, 0.5);
        assert!(midway.center.lng < start.center.lng && midway.center.lng > options.center.lng);
        assert!(midway.zoom < 15.9);
    }

    #[test]
    fn extreme_zoom_caps_flight_length() {
        let start = CameraState::default();
        let options = FlyToOptions::to(LngLat::new(2.29, 48.86), 1e21, 60.0, 0.0);
        assert_eq!(options.duration_from(&start), Duration::from_secs_f64(MAX_FLIGHT_SECS));

        let mut options = FlyToOptions::to(LngLat::new(2.29, 48.86), f64::MAX, 60.0, 0.0);
        options.speed = f64::MIN_POSITIVE;
        assert_eq!(options.duration_from(&start), Duration::from_secs_f64(MAX_FLIGHT_SECS));
    }

    #[test]
    fn view_angles_are_range_checked() {
        assert!(check_view_angles(15.9, 65.0, -11.2).is_ok());
        assert!(check_view_angles(0.0, 0.0, 0.0).is_ok());
        assert!(check_view_angles(1e21, 60.0, 0.0).is_err());
        assert!(check_view_angles(-1.0, 60.0, 0.0).is_err());
        assert!(check_view_angles(12.0, 90.0, 0.0).is_err());
        assert!(check_view_angles(12.0, 60.0, f64::INFINITY).is_err());

        let mut camera = CameraState::default();
        assert!(camera.validate().is_ok());
        camera.zoom = 1e21;
        assert!(camera.validate().is_err());
    }

    #[test]
    fn listeners_can_unsubscribe_during_dispatch() {
        let notifier = Arc::new(MoveNotifier::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
        let handle = {
            let weak = Arc::downgrade(&notifier);
            let calls = Arc::clone(&calls);
            let slot = Arc::clone(&slot);
            notifier.subscribe(Box::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let (Some(n), Some(h)) = (weak.upgrade(), *slot.lock().unwrap()) {
                    assert!(n.unsubscribe(h));
                }
            }))
        };
        *slot.lock().unwrap() = Some(handle);

        notifier.notify(&at(0.0, 0.0));
        notifier.notify(&at(1.0, 1.0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.listener_count(), 0);
        assert!(!notifier.unsubscribe(handle));
    }

    #[test]
    fn unsubscribed_peer_is_skipped_in_same_dispatch() {
        let notifier = Arc::new(MoveNotifier::new());
        let second_calls = Arc::new(AtomicUsize::new(0));
        let second_handle: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

        {
            let weak = Arc::downgrade(&notifier);
            let second_handle = Arc::clone(&second_handle);
            notifier.subscribe(Box::new(move |_| {
                if let (Some(n), Some(h)) = (weak.upgrade(), *second_handle.lock().unwrap()) {
                    n.unsubscribe(h);
                }
            }));
        }
        let calls = Arc::clone(&second_calls);
        let handle = notifier.subscribe(Box::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        }));
        *second_handle.lock().unwrap() = Some(handle);

        notifier.notify(&at(0.0, 0.0));
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.listener_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flight_reaches_target_and_reports_progress() {
        let engine = Arc::new(CameraEngine::new(CameraState::default(), Duration::from_millis(16)));
        let positions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&positions);
        engine.subscribe(Box::new(move |camera| sink.lock().unwrap().push(*camera)));

        let target = LngLat::new(2.29, 48.86);
        engine.fly_to(FlyToOptions::to(target, 15.0, 60.0, -10.0));
        assert!(engine.is_flying());

        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!engine.is_flying());
        assert_eq!(engine.camera().center, target);
        let positions = positions.lock().unwrap();
        assert!(positions.len() > 10);
        assert_eq!(positions.last().unwrap().center, target);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_leaves_camera_mid_flight() {
        let engine = Arc::new(CameraEngine::new(CameraState::default(), Duration::from_millis(16)));
        let target = LngLat::new(2.29, 48.86);
        engine.fly_to(FlyToOptions::to(target, 15.0, 60.0, -10.0));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(engine.stop());
        let halted = engine.camera();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(engine.camera(), halted);
        assert_ne!(halted.center, target);
        assert!(!engine.stop());
    }
}
