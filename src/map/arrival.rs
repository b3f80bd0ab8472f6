use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use super::camera::{CameraObserver, CameraState, LngLat, SubscriptionHandle};

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Default)]
struct WatchState {
    status: AtomicU8,
    handle: OnceLock<SubscriptionHandle>,
}

impl WatchState {
    /// Moves from armed to `next`; false if already settled.
    fn settle(&self, next: u8) -> bool {
        self.status
            .compare_exchange(ARMED, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_settled(&self) -> bool {
        self.status.load(Ordering::Acquire) != ARMED
    }
}

/// Watches camera movement until the center comes within tolerance of a target,
/// then unsubscribes and runs its callback once. There is no timeout: a camera
/// that never arrives leaves the watcher armed until it is cancelled.
pub struct ArrivalWatcher {
    state: Arc<WatchState>,
    observer: Weak<dyn CameraObserver>,
}

impl ArrivalWatcher {
    pub fn arm<O, F>(observer: &Arc<O>, target: LngLat, tolerance: f64, on_arrival: F) -> Self
    where
        O: CameraObserver + 'static,
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(WatchState::default());
        let weak_observer: Weak<dyn CameraObserver> = Arc::downgrade(observer) as Weak<dyn CameraObserver>;

        let listener_state = Arc::clone(&state);
        let listener_observer = weak_observer.clone();
        let mut on_arrival = Some(on_arrival);

        let handle = observer.subscribe(Box::new(move |camera: &CameraState| {
            if !camera.center.within(&target, tolerance) {
                return;
            }
            if !listener_state.settle(FIRED) {
                return;
            }
            if let (Some(handle), Some(observer)) =
                (listener_state.handle.get(), listener_observer.upgrade())
            {
                observer.unsubscribe(*handle);
            }
            if let Some(callback) = on_arrival.take() {
                callback();
            }
        }));

        let _ = state.handle.set(handle);
        // Arrived before the handle was recorded
        if state.is_settled() {
            observer.unsubscribe(handle);
        }

        Self {
            state,
            observer: weak_observer,
        }
    }

    #[cfg(test)]
    pub fn has_fired(&self) -> bool {
        self.state.status.load(Ordering::Acquire) == FIRED
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        !self.state.is_settled()
    }

    /// Disarms the watcher; its callback will not run. Returns false if it had already settled.
    pub fn cancel(&self) -> bool {
        if !self.state.settle(CANCELLED) {
            return false;
        }
        if let (Some(handle), Some(observer)) = (self.state.handle.get(), self.observer.upgrade()) {
            observer.unsubscribe(*handle);
        }
        true
    }
}
