use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::style::PaintTarget;
use crate::constants::*;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseParams {
    /// Frames per grow-and-fade cycle. Timing is counted in frames, not wall-clock time.
    pub frames_per_cycle: f64,
    pub max_radius: f64,
    pub initial_radius: f64,
    pub initial_opacity: f64,
}

impl Default for PulseParams {
    fn default() -> Self {
        Self {
            frames_per_cycle: PULSE_FRAMES_PER_CYCLE,
            max_radius: PULSE_MAX_RADIUS,
            initial_radius: PULSE_INITIAL_RADIUS,
            initial_opacity: PULSE_INITIAL_OPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseState {
    pub radius: f64,
    pub opacity: f64,
}

/// Values pushed to the layer for one frame, before any cycle reset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseFrame {
    pub radius: f64,
    pub opacity: f64,
    pub cycle_completed: bool,
}

impl PulseState {
    pub fn initial(params: &PulseParams) -> Self {
        Self {
            radius: params.initial_radius,
            opacity: params.initial_opacity,
        }
    }

    pub fn advance(&mut self, params: &PulseParams) -> PulseFrame {
        self.radius += (params.max_radius - self.radius) / params.frames_per_cycle;
        self.opacity = (self.opacity - PULSE_FADE / params.frames_per_cycle).max(0.0);

        let frame = PulseFrame {
            radius: self.radius,
            opacity: self.opacity,
            cycle_completed: self.opacity <= 0.0,
        };
        if frame.cycle_completed {
            *self = Self::initial(params);
        }
        frame
    }
}

fn render_frame(state: &Mutex<PulseState>, params: &PulseParams, target: &dyn PaintTarget) -> PulseFrame {
    let frame = state.lock().unwrap_or_else(PoisonError::into_inner).advance(params);
    target.set_paint_property(PULSE_LAYER_ID, "circle-radius", json!(frame.radius));
    target.set_paint_property(PULSE_LAYER_ID, "circle-opacity", json!(frame.opacity));
    frame
}

/// Repeating grow-and-fade animation for the pulse layer. Starts at most once per
/// animator; after `stop` it stays stopped.
pub struct PulseAnimator {
    params: PulseParams,
    frame_interval: Duration,
    state: Arc<Mutex<PulseState>>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PulseAnimator {
    pub fn new(params: PulseParams, frame_interval: Duration) -> Self {
        Self {
            params,
            frame_interval,
            state: Arc::new(Mutex::new(PulseState::initial(&params))),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PulseState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Spawns the frame loop. Returns false (and does nothing) if already started.
    pub fn start(&self, target: Arc<dyn PaintTarget>) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }

        let state = Arc::clone(&self.state);
        let params = self.params;
        let interval = self.frame_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                render_frame(&state, &params, target.as_ref());
            }
        });

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        tracing::info!("💫 Marker pulse started ({} frames per cycle)", params.frames_per_cycle);
        true
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
            tracing::info!("💤 Marker pulse stopped");
        }
    }

    /// Renders a single frame outside the loop.
    #[cfg(test)]
    pub fn step(&self, target: &dyn PaintTarget) -> PulseFrame {
        render_frame(&self.state, &self.params, target)
    }
}

impl Drop for PulseAnimator {
    fn drop(&mut self) {
        self.stop();
    }
}
