use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::constants::*;

/// Anything that accepts paint property updates for a named layer.
pub trait PaintTarget: Send + Sync {
    fn set_paint_property(&self, layer_id: &str, name: &str, value: Value);
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StyleSnapshot {
    pub sources: BTreeMap<String, Value>,
    pub layers: Vec<Value>,
}

/// Sources and layers as the map renderer should hold them. Every tower change
/// replaces the whole source; nothing is diffed.
#[derive(Default)]
pub struct MapStyle {
    inner: Mutex<StyleSnapshot>,
}

fn layer_id(layer: &Value) -> Option<&str> {
    layer.get("id").and_then(Value::as_str)
}

impl MapStyle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the source, or replaces its data if it already exists.
    pub fn set_source_data(&self, source_id: &str, data: Value) {
        let mut style = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        style.sources.insert(
            source_id.to_string(),
            json!({ "type": "geojson", "data": data }),
        );
    }

    pub fn has_layer(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .layers
            .iter()
            .any(|layer| layer_id(layer) == Some(id))
    }

    pub fn add_layer(&self, layer: Value) -> Result<()> {
        let Some(id) = layer_id(&layer).map(str::to_string) else {
            bail!("Layer definition has no id");
        };
        let mut style = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if style.layers.iter().any(|l| layer_id(l) == Some(id.as_str())) {
            bail!("Layer '{}' already exists", id);
        }
        if let Some(source) = layer.get("source").and_then(Value::as_str) {
            if !style.sources.contains_key(source) {
                bail!("Layer '{}' references missing source '{}'", id, source);
            }
        }
        style.layers.push(layer);
        Ok(())
    }

    #[cfg(test)]
    pub fn paint_property(&self, layer: &str, name: &str) -> Option<Value> {
        let style = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        style
            .layers
            .iter()
            .find(|l| layer_id(l) == Some(layer))
            .and_then(|l| l.get("paint"))
            .and_then(|paint| paint.get(name))
            .cloned()
    }

    pub fn try_set_paint_property(&self, layer: &str, name: &str, value: Value) -> Result<()> {
        let mut style = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(target) = style.layers.iter_mut().find(|l| layer_id(l) == Some(layer)) else {
            bail!("Layer '{}' does not exist", layer);
        };
        let Some(object) = target.as_object_mut() else {
            bail!("Layer '{}' is not an object", layer);
        };
        let paint = object
            .entry("paint")
            .or_insert_with(|| Value::Object(Map::new()));
        match paint.as_object_mut() {
            Some(paint) => {
                paint.insert(name.to_string(), value);
                Ok(())
            }
            None => bail!("Layer '{}' has a malformed paint block", layer),
        }
    }

    /// Replaces tower point data and creates the tower layers on first use.
    /// Returns true when the layers were created by this call.
    pub fn sync_towers(&self, collection: Value) -> Result<bool> {
        self.set_source_data(TOWER_SOURCE_ID, collection);

        let mut created = false;
        if !self.has_layer(PULSE_LAYER_ID) {
            self.add_layer(pulse_layer())?;
            created = true;
        }
        if !self.has_layer(DOT_LAYER_ID) {
            self.add_layer(dot_layer())?;
            created = true;
        }
        if !self.has_layer(PIN_LAYER_ID) {
            self.add_layer(pin_layer())?;
            created = true;
        }
        Ok(created)
    }

    pub fn snapshot(&self) -> StyleSnapshot {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl PaintTarget for MapStyle {
    fn set_paint_property(&self, layer_id: &str, name: &str, value: Value) {
        if let Err(e) = self.try_set_paint_property(layer_id, name, value) {
            tracing::debug!("Paint update skipped: {}", e);
        }
    }
}

fn pulse_layer() -> Value {
    json!({
        "id": PULSE_LAYER_ID,
        "type": "circle",
        "source": TOWER_SOURCE_ID,
        "maxzoom": 14,
        "paint": {
            "circle-radius": PULSE_INITIAL_RADIUS,
            "circle-radius-transition": { "duration": 0 },
            "circle-opacity-transition": { "duration": 0 },
            "circle-color": "#ffffff",
            "circle-emissive-strength": 1,
            "circle-opacity": 0.6
        }
    })
}

fn dot_layer() -> Value {
    json!({
        "id": DOT_LAYER_ID,
        "type": "circle",
        "source": TOWER_SOURCE_ID,
        "maxzoom": 14,
        "paint": {
            "circle-radius": 3,
            "circle-color": "#aaa",
            "circle-emissive-strength": 1,
            "circle-opacity": 1,
            "circle-stroke-color": "#ffffff",
            "circle-stroke-width": 2
        }
    })
}

fn pin_layer() -> Value {
    json!({
        "id": PIN_LAYER_ID,
        "type": "symbol",
        "source": TOWER_SOURCE_ID,
        "minzoom": 2,
        "layout": {
            "icon-allow-overlap": true,
            "icon-image": ["get", "maki"],
            "icon-size": ["interpolate", ["linear"], ["zoom"], 2, 0.5, 12, 0.8],
            "symbol-placement": "point",
            "symbol-z-elevate": true,
            "text-field": ["to-string", ["get", "name"]],
            "text-font": ["Manrope Medium", "Arial Unicode MS Bold"],
            "text-anchor": "top",
            "text-offset": [0, 1.6],
            "text-size": ["interpolate", ["linear"], ["zoom"], 2, 11, 12, 13],
            "text-max-width": 5
        },
        "paint": {
            "text-color": [
                "interpolate", ["linear"], ["measure-light", "brightness"],
                0.28, "hsl(0, 0%, 100%)",
                0.3, "hsl(0, 0%, 0%)"
            ],
            "text-emissive-strength": 1,
            "text-halo-color": "hsl(0, 0%, 0%)",
            "text-halo-width": 1
        }
    })
}
