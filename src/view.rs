use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::map::camera::{check_view_angles, CameraState};
use crate::towers::{parse_coordinates, PointFeature, TowerNotFound, TowerProperties};

pub const ADD_HEADING: &str = "Add New Tower";
pub const ADD_BUTTON: &str = "Add Tower";
pub const EDIT_HEADING: &str = "Edit Tower";
pub const EDIT_BUTTON: &str = "Update Tower";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavEntry {
    pub id: String,
    pub name: String,
    pub panel_info: String,
}

impl NavEntry {
    fn from_feature(feature: &PointFeature) -> Self {
        Self {
            id: feature.id.clone(),
            name: feature.properties.name.clone(),
            panel_info: feature.properties.panel_info.clone(),
        }
    }
}

/// Side navigation list, one entry per tower in collection order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NavigationList {
    entries: Vec<NavEntry>,
}

impl NavigationList {
    pub fn from_features(features: &[PointFeature]) -> Self {
        Self {
            entries: features.iter().map(NavEntry::from_feature).collect(),
        }
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[NavEntry] {
        &self.entries
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn append(&mut self, feature: &PointFeature) {
        self.entries.push(NavEntry::from_feature(feature));
    }

    /// Refreshes the label of an existing entry.
    pub fn refresh(&mut self, feature: &PointFeature) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == feature.id) {
            *entry = NavEntry::from_feature(feature);
        }
    }

    pub fn remove(&mut self, id: &str) -> Result<NavEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| TowerNotFound(id.to_string()))?;
        Ok(self.entries.remove(index))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopupView {
    pub hidden: bool,
    pub id: Option<String>,
    pub title: String,
    pub image_src: String,
    pub description: String,
}

impl Default for PopupView {
    fn default() -> Self {
        Self {
            hidden: true,
            id: None,
            title: String::new(),
            image_src: String::new(),
            description: String::new(),
        }
    }
}

impl PopupView {
    pub fn populate(&mut self, feature: &PointFeature) {
        self.id = Some(feature.id.clone());
        self.title = feature.properties.name.clone();
        self.image_src = feature.properties.image_src.clone();
        self.description = feature.properties.description.clone();
    }
}

/// Panel form fields, kept as the text the user typed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TowerForm {
    /// Set when editing an existing tower.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "panel-info", default)]
    pub panel_info: String,
    #[serde(default)]
    pub maki: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub pitch: String,
    #[serde(default)]
    pub bearing: String,
    #[serde(default)]
    pub zoom: String,
    #[serde(default)]
    pub coordinates: String,
}

fn parse_number(field: &str, text: &str) -> Result<f64> {
    let value: f64 = text
        .trim()
        .parse()
        .with_context(|| format!("Field '{}' is not a number: {:?}", field, text))?;
    anyhow::ensure!(value.is_finite(), "Field '{}' must be finite", field);
    Ok(value)
}

impl TowerForm {
    pub fn from_feature(feature: &PointFeature) -> Self {
        let coordinates = feature
            .coordinates()
            .map(|c| format!("{}, {}", c.lng, c.lat))
            .unwrap_or_default();
        Self {
            id: Some(feature.id.clone()),
            panel_info: feature.properties.panel_info.clone(),
            maki: feature.properties.icon_ref.clone(),
            name: feature.properties.name.clone(),
            src: feature.properties.image_src.clone(),
            desc: feature.properties.description.clone(),
            pitch: feature.properties.pitch.to_string(),
            bearing: feature.properties.bearing.to_string(),
            zoom: feature.properties.zoom.to_string(),
            coordinates,
        }
    }

    /// Writes the camera into the camera fields, rounded for a fresh form.
    pub fn fill_camera(&mut self, camera: &CameraState, rounded: bool) {
        let fmt = |v: f64| if rounded { v.round().to_string() } else { v.to_string() };
        self.pitch = fmt(camera.pitch);
        self.bearing = fmt(camera.bearing);
        self.zoom = fmt(camera.zoom);
        self.coordinates = format!("{}, {}", camera.center.lng, camera.center.lat);
    }

    /// Builds a feature. Unparsable coordinates become `None`; bad camera numbers are an error.
    pub fn to_feature(&self) -> Result<PointFeature> {
        let properties = TowerProperties {
            panel_info: self.panel_info.clone(),
            icon_ref: self.maki.clone(),
            name: self.name.clone(),
            image_src: self.src.clone(),
            description: self.desc.clone(),
            pitch: parse_number("pitch", &self.pitch)?,
            bearing: parse_number("bearing", &self.bearing)?,
            zoom: parse_number("zoom", &self.zoom)?,
        };
        check_view_angles(properties.zoom, properties.pitch, properties.bearing)?;
        let coordinates = parse_coordinates(&self.coordinates);
        if coordinates.is_none() {
            tracing::warn!("⚠️  Unparsable coordinates {:?}; tower stored without a location", self.coordinates);
        }
        Ok(PointFeature::new(
            self.id.clone().unwrap_or_default(),
            properties,
            coordinates,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditPanel {
    pub hidden: bool,
    pub heading: String,
    pub submit_label: String,
    pub form: TowerForm,
}

impl Default for EditPanel {
    fn default() -> Self {
        Self {
            hidden: true,
            heading: ADD_HEADING.to_string(),
            submit_label: ADD_BUTTON.to_string(),
            form: TowerForm::default(),
        }
    }
}

/// Everything the browser shows besides the map itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub nav_hidden: bool,
    pub nav: NavigationList,
    pub popup: PopupView,
    pub panel: EditPanel,
    pub edit_hidden: bool,
    pub delete_hidden: bool,
    pub toggle_disabled: bool,
    pub edit_mode: bool,
}

impl ViewState {
    pub fn new(features: &[PointFeature]) -> Self {
        Self {
            nav: NavigationList::from_features(features),
            edit_hidden: true,
            delete_hidden: true,
            ..Self::default()
        }
    }

    /// Popup with its edit and delete controls.
    pub fn reveal_popup(&mut self, feature: &PointFeature) {
        self.popup.populate(feature);
        self.popup.hidden = false;
        self.edit_hidden = false;
        self.delete_hidden = false;
    }

    pub fn close_popup(&mut self) {
        self.popup.hidden = true;
        self.edit_hidden = true;
        self.delete_hidden = true;
    }

    fn reset_form(&mut self) {
        self.panel.form = TowerForm::default();
    }

    pub fn toggle_add_panel(&mut self, camera: &CameraState) {
        self.reset_form();
        self.panel.heading = ADD_HEADING.to_string();
        self.panel.submit_label = ADD_BUTTON.to_string();

        if self.edit_mode {
            self.edit_mode = false;
            self.nav_hidden = false;
            self.panel.hidden = true;
        } else {
            self.edit_mode = true;
            self.popup.hidden = true;
            self.nav_hidden = true;
            self.panel.hidden = false;
            self.panel.form.fill_camera(camera, true);
        }
    }

    /// Opens the panel on `feature`, or closes it when already editing.
    pub fn toggle_edit_panel(&mut self, feature: Option<&PointFeature>) -> Result<()> {
        if self.edit_mode {
            self.edit_mode = false;
            self.panel.hidden = true;
            self.popup.hidden = false;
            self.nav_hidden = false;
            self.reset_form();
            self.toggle_disabled = false;
            return Ok(());
        }

        let feature = feature.ok_or_else(|| {
            TowerNotFound(self.popup.id.clone().unwrap_or_default())
        })?;
        self.edit_mode = true;
        self.toggle_disabled = true;
        self.panel.hidden = false;
        self.popup.hidden = true;
        self.nav_hidden = true;
        self.panel.heading = EDIT_HEADING.to_string();
        self.panel.submit_label = EDIT_BUTTON.to_string();
        self.panel.form = TowerForm::from_feature(feature);
        Ok(())
    }

    /// Live camera tracking while the panel is open.
    pub fn track_camera(&mut self, camera: &CameraState) -> bool {
        if !self.edit_mode {
            return false;
        }
        self.panel.form.fill_camera(camera, false);
        true
    }

    pub fn finish_submit(&mut self, edited: bool) {
        if edited {
            self.edit_hidden = true;
            self.delete_hidden = true;
        }
        self.edit_mode = false;
        self.panel.hidden = true;
        self.nav_hidden = false;
        self.reset_form();
        self.toggle_disabled = false;
    }

    pub fn after_delete(&mut self) {
        self.popup.hidden = true;
        self.popup.id = None;
        self.edit_hidden = true;
        self.delete_hidden = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::camera::LngLat;
    use crate::towers::TowerStore;

    fn paris() -> PointFeature {
        TowerStore::seeded().unwrap().get("paris").unwrap().clone()
    }

    fn camera() -> CameraState {
        CameraState {
            center: LngLat::new(2.5, 48.25),
            zoom: 12.6,
            pitch: 44.4,
            bearing: -11.6,
        }
    }

    #[test]
    fn add_panel_prefills_rounded_camera() {
        let mut view = ViewState::new(&[paris()]);
        view.toggle_add_panel(&camera());

        assert!(view.edit_mode);
        assert!(view.nav_hidden && view.popup.hidden && !view.panel.hidden);
        assert_eq!(view.panel.heading, ADD_HEADING);
        assert_eq!(view.panel.form.pitch, "44");
        assert_eq!(view.panel.form.bearing, "-12");
        assert_eq!(view.panel.form.zoom, "13");
        assert_eq!(view.panel.form.coordinates, "2.5, 48.25");

        view.toggle_add_panel(&camera());
        assert!(!view.edit_mode);
        assert!(!view.nav_hidden && view.panel.hidden);
        assert_eq!(view.panel.form, TowerForm::default());
    }

    #[test]
    fn edit_panel_prefills_from_feature() {
        let tower = paris();
        let mut view = ViewState::new(&[tower.clone()]);
        view.reveal_popup(&tower);
        view.toggle_edit_panel(Some(&tower)).unwrap();

        assert!(view.toggle_disabled);
        assert_eq!(view.panel.heading, EDIT_HEADING);
        assert_eq!(view.panel.submit_label, EDIT_BUTTON);
        assert_eq!(view.panel.form.id.as_deref(), Some("paris"));
        assert_eq!(view.panel.form.maki, tower.properties.icon_ref);
        assert_eq!(view.panel.form.coordinates, "2.2945245246351655, 48.85824690254192");

        view.toggle_edit_panel(None).unwrap();
        assert!(!view.popup.hidden && view.panel.hidden && !view.toggle_disabled);
    }

    #[test]
    fn edit_without_selection_fails() {
        let mut view = ViewState::new(&[]);
        assert!(view.toggle_edit_panel(None).is_err());
        assert!(!view.edit_mode);
    }

    #[test]
    fn camera_is_tracked_only_while_editing() {
        let mut view = ViewState::new(&[]);
        assert!(!view.track_camera(&camera()));
        view.toggle_add_panel(&CameraState::default());
        assert!(view.track_camera(&camera()));
        assert_eq!(view.panel.form.pitch, "44.4");
        assert_eq!(view.panel.form.zoom, "12.6");
    }

    #[test]
    fn form_round_trips_through_feature() {
        let tower = paris();
        let form = TowerForm::from_feature(&tower);
        assert_eq!(form.to_feature().unwrap(), tower);
    }

    #[test]
    fn form_number_errors_and_soft_coordinates() {
        let mut form = TowerForm::from_feature(&paris());
        form.coordinates = "not-a-number".to_string();
        let feature = form.to_feature().unwrap();
        assert_eq!(feature.coordinates(), None);

        form.zoom = "deep".to_string();
        assert!(form.to_feature().is_err());
    }

    #[test]
    fn form_rejects_out_of_range_view_angles() {
        let mut form = TowerForm::from_feature(&paris());
        form.zoom = "1e21".to_string();
        assert!(form.to_feature().is_err());

        form.zoom = "24".to_string();
        form.pitch = "90".to_string();
        assert!(form.to_feature().is_err());

        form.pitch = "85".to_string();
        assert!(form.to_feature().is_ok());
    }

    #[test]
    fn nav_remove_reports_missing_entries() {
        let mut nav = NavigationList::from_features(&[paris()]);
        assert!(nav.remove("tokyo").is_err());
        assert_eq!(nav.remove("paris").unwrap().name, "Eiffel Tower");
        assert!(nav.entries().is_empty());
    }
}
