use std::sync::{Arc, Mutex};

use crate::session::MapSession;
use crate::settings::Settings;

// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub session: MapSession,
    pub settings: Arc<Mutex<Settings>>,
}
