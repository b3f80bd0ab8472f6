use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::map::camera::LngLat;

// Seed data shipped with the binary
const SEED_TOWERS: &str = include_str!("data/towers.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FeatureTag {
    #[default]
    Feature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GeometryTag {
    #[default]
    Point,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TowerProperties {
    #[serde(rename = "panel-info")]
    pub panel_info: String,
    #[serde(rename = "maki")]
    pub icon_ref: String,
    pub name: String,
    #[serde(rename = "src")]
    pub image_src: String,
    #[serde(rename = "desc")]
    pub description: String,
    pub pitch: f64,
    pub bearing: f64,
    pub zoom: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointGeometry {
    /// `None` when the coordinate text could not be parsed.
    pub coordinates: Option<LngLat>,
    #[serde(rename = "type", default)]
    pub kind: GeometryTag,
}

/// A tower as a GeoJSON point feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointFeature {
    #[serde(rename = "type", default)]
    pub kind: FeatureTag,
    pub properties: TowerProperties,
    pub geometry: PointGeometry,
    #[serde(default)]
    pub id: String,
}

impl PointFeature {
    pub fn new(id: impl Into<String>, properties: TowerProperties, coordinates: Option<LngLat>) -> Self {
        Self {
            kind: FeatureTag::Feature,
            properties,
            geometry: PointGeometry {
                coordinates,
                kind: GeometryTag::Point,
            },
            id: id.into(),
        }
    }

    pub fn coordinates(&self) -> Option<LngLat> {
        self.geometry.coordinates
    }
}

#[derive(Debug, Deserialize)]
struct SeedCollection {
    features: Vec<PointFeature>,
}

/// Returned (inside `anyhow::Error`) when an id has no tower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TowerNotFound(pub String);

impl fmt::Display for TowerNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tower '{}' not found", self.0)
    }
}

impl std::error::Error for TowerNotFound {}

/// Parses `"lng, lat"`. Anything other than exactly two finite, in-range numbers yields `None`.
pub fn parse_coordinates(text: &str) -> Option<LngLat> {
    let parts: Vec<&str> = text.split(',').map(str::trim).collect();
    if parts.len() != 2 {
        return None;
    }
    let lng = parts[0].parse::<f64>().ok()?;
    let lat = parts[1].parse::<f64>().ok()?;
    let point = LngLat::new(lng, lat);
    point.is_valid().then_some(point)
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Millisecond timestamp in base 36 followed by six random characters.
pub fn generate_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", to_base36(millis), &random[..6])
}

/// Ordered tower collection; insertion order is navigation order.
#[derive(Debug, Clone, Default)]
pub struct TowerStore {
    features: Vec<PointFeature>,
}

impl TowerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded() -> Result<Self> {
        Self::from_json(SEED_TOWERS).context("Failed to load built-in tower data")
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let seed: SeedCollection = serde_json::from_str(data).context("Invalid tower collection")?;
        let mut store = Self::new();
        for feature in seed.features {
            store.add(feature)?;
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn features(&self) -> &[PointFeature] {
        &self.features
    }

    pub fn get(&self, id: &str) -> Option<&PointFeature> {
        self.features.iter().find(|f| f.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.features.iter().position(|f| f.id == id)
    }

    /// Appends a tower, generating an id when it has none.
    pub fn add(&mut self, mut feature: PointFeature) -> Result<&PointFeature> {
        if feature.id.trim().is_empty() {
            feature.id = generate_id();
        }
        if self.get(&feature.id).is_some() {
            bail!("Tower '{}' already exists", feature.id);
        }
        self.features.push(feature);
        Ok(&self.features[self.features.len() - 1])
    }

    /// Replaces the tower in place. The stored id and position never change.
    pub fn edit(&mut self, id: &str, mut updated: PointFeature) -> Result<&PointFeature> {
        let index = self
            .position(id)
            .ok_or_else(|| TowerNotFound(id.to_string()))?;
        updated.id = id.to_string();
        self.features[index] = updated;
        Ok(&self.features[index])
    }

    pub fn delete(&mut self, id: &str) -> Result<PointFeature> {
        let index = self
            .position(id)
            .ok_or_else(|| TowerNotFound(id.to_string()))?;
        Ok(self.features.remove(index))
    }

    /// Distinct icon references, first-seen order.
    pub fn icon_refs(&self) -> Vec<String> {
        let mut refs: Vec<String> = Vec::new();
        for feature in &self.features {
            if !refs.contains(&feature.properties.icon_ref) {
                refs.push(feature.properties.icon_ref.clone());
            }
        }
        refs
    }

    /// Full collection, including towers without coordinates.
    pub fn to_geojson(&self) -> Value {
        json!({ "type": "FeatureCollection", "features": self.features })
    }

    /// Collection for the map source; towers without coordinates are left out.
    pub fn renderable_geojson(&self) -> Value {
        let features: Vec<&PointFeature> = self
            .features
            .iter()
            .filter(|f| f.coordinates().is_some())
            .collect();
        json!({ "type": "FeatureCollection", "features": features })
    }
}
