use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::map::camera::CameraState;
use crate::view::{TowerForm, ViewState};

// SSE Event types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapEvent {
    pub event_type: String,
    pub data: MapEventData,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MapEventData {
    pub camera: Option<CameraState>,
    pub layer: Option<String>,
    pub property: Option<String>,
    pub value: Option<Value>,
    pub tower_id: Option<String>,
    pub view: Option<ViewState>,
    pub form: Option<TowerForm>,
    pub source: Option<Value>,
    pub message: Option<String>,
}

impl MapEvent {
    pub fn new(event_type: &str, data: MapEventData) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
        }
    }

    pub fn camera(camera: &CameraState) -> Self {
        Self::new(
            "camera",
            MapEventData {
                camera: Some(*camera),
                ..Default::default()
            },
        )
    }

    pub fn paint(layer: &str, property: &str, value: Value) -> Self {
        Self::new(
            "paint",
            MapEventData {
                layer: Some(layer.to_string()),
                property: Some(property.to_string()),
                value: Some(value),
                ..Default::default()
            },
        )
    }

    pub fn view(view: &ViewState) -> Self {
        Self::new(
            "view",
            MapEventData {
                view: Some(view.clone()),
                ..Default::default()
            },
        )
    }

    /// Camera-driven refresh of the open panel's form.
    pub fn form(form: &TowerForm) -> Self {
        Self::new(
            "form",
            MapEventData {
                form: Some(form.clone()),
                ..Default::default()
            },
        )
    }

    pub fn arrival(tower_id: &str) -> Self {
        Self::new(
            "arrival",
            MapEventData {
                tower_id: Some(tower_id.to_string()),
                ..Default::default()
            },
        )
    }

    pub fn source(data: Value) -> Self {
        Self::new(
            "source",
            MapEventData {
                source: Some(data),
                ..Default::default()
            },
        )
    }

    pub fn heartbeat() -> Self {
        Self::new(
            "heartbeat",
            MapEventData {
                message: Some("SSE connection alive".to_string()),
                ..Default::default()
            },
        )
    }
}
