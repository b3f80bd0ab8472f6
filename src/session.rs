use anyhow::{bail, Result};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::map::camera::{CameraObserver, CameraState, FlyToOptions, LngLat};
use crate::map::icons::IconImage;
use crate::map::pulse::{PulseParams, PulseState};
use crate::map::style::StyleSnapshot;
use crate::map::{ArrivalWatcher, CameraEngine, IconRegistry, MapStyle, PaintTarget, PulseAnimator};
use crate::server::events::MapEvent;
use crate::settings::Settings;
use crate::towers::{PointFeature, TowerNotFound, TowerStore};
use crate::view::{TowerForm, ViewState};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub arrival_tolerance: f64,
    pub settle_delay: Duration,
    pub fly_speed: f64,
    pub fly_curve: f64,
    pub frame_interval: Duration,
    pub pulse: PulseParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            arrival_tolerance: settings.arrival_tolerance,
            settle_delay: settings.settle_delay(),
            fly_speed: settings.fly_speed,
            fly_curve: settings.fly_curve,
            frame_interval: settings.frame_interval(),
            pulse: settings.pulse_params(),
        }
    }
}

struct SessionState {
    towers: TowerStore,
    view: ViewState,
    flying: bool,
    flight_seq: u64,
    watcher: Option<ArrivalWatcher>,
}

impl SessionState {
    fn cancel_watch(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.cancel();
        }
        self.flying = false;
    }
}

struct SessionInner {
    state: Mutex<SessionState>,
    camera: Arc<CameraEngine>,
    style: Arc<MapStyle>,
    icons: IconRegistry,
    pulse: PulseAnimator,
    events: broadcast::Sender<MapEvent>,
    config: SessionConfig,
}

/// Pulse frames go to the style and out to connected browsers.
struct LivePaint {
    style: Arc<MapStyle>,
    events: broadcast::Sender<MapEvent>,
}

impl PaintTarget for LivePaint {
    fn set_paint_property(&self, layer_id: &str, name: &str, value: Value) {
        self.style.set_paint_property(layer_id, name, value.clone());
        let _ = self.events.send(MapEvent::paint(layer_id, name, value));
    }
}

impl SessionInner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_view(&self, view: &ViewState) {
        let _ = self.events.send(MapEvent::view(view));
    }

    fn on_arrival(&self, seq: u64, tower_id: &str) {
        let view = {
            let mut state = self.lock_state();
            if state.flight_seq != seq {
                return;
            }
            state.flying = false;
            state.watcher = None;
            // The tower may have changed or gone while the camera was moving
            let Some(feature) = state.towers.get(tower_id).cloned() else {
                tracing::warn!("Arrived at '{}' but it no longer exists", tower_id);
                return;
            };
            state.view.reveal_popup(&feature);
            state.view.clone()
        };
        tracing::info!("📍 Arrived at '{}'", tower_id);
        let _ = self.events.send(MapEvent::arrival(tower_id));
        self.publish_view(&view);
    }

    fn on_camera_moved(&self, camera: &CameraState) {
        let _ = self.events.send(MapEvent::camera(camera));
        let tracked = {
            let mut state = self.lock_state();
            state.view.track_camera(camera).then(|| state.view.panel.form.clone())
        };
        // Only the camera fields changed; the browser keeps what the user typed elsewhere
        if let Some(form) = tracked {
            let _ = self.events.send(MapEvent::form(&form));
        }
    }

    fn fly_options(&self, feature: &PointFeature, center: LngLat) -> FlyToOptions {
        let mut options = FlyToOptions::to(
            center,
            feature.properties.zoom,
            feature.properties.pitch,
            feature.properties.bearing,
        );
        options.speed = self.config.fly_speed;
        options.curve = self.config.fly_curve;
        options
    }
}

fn located(feature: &PointFeature) -> Result<LngLat> {
    match feature.coordinates() {
        Some(center) => Ok(center),
        None => bail!("Tower '{}' has no coordinates to fly to", feature.id),
    }
}

/// The map session: every tower, view and camera change goes through here.
#[derive(Clone)]
pub struct MapSession {
    inner: Arc<SessionInner>,
}

impl MapSession {
    pub fn new(config: SessionConfig, towers: TowerStore, events: broadcast::Sender<MapEvent>) -> Result<Self> {
        let view = ViewState::new(towers.features());
        let inner = Arc::new(SessionInner {
            state: Mutex::new(SessionState {
                towers,
                view,
                flying: false,
                flight_seq: 0,
                watcher: None,
            }),
            camera: Arc::new(CameraEngine::new(CameraState::default(), config.frame_interval)),
            style: Arc::new(MapStyle::new()),
            icons: IconRegistry::new()?,
            pulse: PulseAnimator::new(config.pulse, config.frame_interval),
            events,
            config,
        });

        let weak = Arc::downgrade(&inner);
        inner.camera.subscribe(Box::new(move |camera| {
            if let Some(inner) = weak.upgrade() {
                inner.on_camera_moved(camera);
            }
        }));

        Ok(Self { inner })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MapEvent> {
        self.inner.events.subscribe()
    }

    pub fn view(&self) -> ViewState {
        self.inner.lock_state().view.clone()
    }

    pub fn tower(&self, id: &str) -> Option<PointFeature> {
        self.inner.lock_state().towers.get(id).cloned()
    }

    #[cfg(test)]
    pub fn towers(&self) -> Vec<PointFeature> {
        self.inner.lock_state().towers.features().to_vec()
    }

    pub fn towers_geojson(&self) -> Value {
        self.inner.lock_state().towers.to_geojson()
    }

    pub fn camera(&self) -> CameraState {
        self.inner.camera.camera()
    }

    pub fn style(&self) -> StyleSnapshot {
        self.inner.style.snapshot()
    }

    pub fn icon(&self, reference: &str) -> Option<IconImage> {
        self.inner.icons.get(reference)
    }

    pub fn pulse_state(&self) -> PulseState {
        self.inner.pulse.state()
    }

    pub fn is_pulsing(&self) -> bool {
        self.inner.pulse.is_running()
    }

    pub fn is_flying(&self) -> bool {
        self.inner.lock_state().flying
    }

    /// Navigation click: fly to the tower and show its popup once the camera arrives.
    /// A flight already in progress is stopped first and given a moment to settle.
    pub async fn select_tower(&self, id: &str) -> Result<()> {
        let interrupted = {
            let mut state = self.inner.lock_state();
            let feature = state.towers.get(id).ok_or_else(|| TowerNotFound(id.to_string()))?;
            located(feature)?;
            let interrupted = state.flying;
            if interrupted {
                state.cancel_watch();
            }
            interrupted
        };

        if interrupted {
            self.inner.camera.stop();
            tracing::debug!("Flight interrupted, settling before '{}'", id);
            tokio::time::sleep(self.inner.config.settle_delay).await;
        }

        self.fly_and_watch(id)
    }

    fn fly_and_watch(&self, id: &str) -> Result<()> {
        let (feature, center, seq) = {
            let mut state = self.inner.lock_state();
            let feature = state
                .towers
                .get(id)
                .cloned()
                .ok_or_else(|| TowerNotFound(id.to_string()))?;
            let center = located(&feature)?;
            state.cancel_watch();
            state.flight_seq += 1;
            (feature, center, state.flight_seq)
        };

        let weak = Arc::downgrade(&self.inner);
        let tower_id = feature.id.clone();
        let watcher = ArrivalWatcher::arm(
            &self.inner.camera,
            center,
            self.inner.config.arrival_tolerance,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_arrival(seq, &tower_id);
                }
            },
        );

        let view = {
            let mut state = self.inner.lock_state();
            if state.flight_seq != seq {
                // Superseded while arming
                watcher.cancel();
                return Ok(());
            }
            state.watcher = Some(watcher);
            state.flying = true;
            state.view.popup.hidden = true;
            state.view.clone()
        };
        self.inner.publish_view(&view);

        tracing::info!("🛫 Flying to '{}'", feature.id);
        self.inner.camera.fly_to(self.inner.fly_options(&feature, center));
        Ok(())
    }

    /// Click on a tower pin: fly there and show the popup straight away.
    pub fn click_pin(&self, id: &str) -> Result<()> {
        let (feature, center, view) = {
            let mut state = self.inner.lock_state();
            let feature = state
                .towers
                .get(id)
                .cloned()
                .ok_or_else(|| TowerNotFound(id.to_string()))?;
            let center = located(&feature)?;
            state.cancel_watch();
            state.flight_seq += 1;
            state.view.popup.populate(&feature);
            state.view.popup.hidden = false;
            (feature, center, state.view.clone())
        };
        self.inner.publish_view(&view);
        self.inner.camera.fly_to(self.inner.fly_options(&feature, center));
        Ok(())
    }

    pub fn close_popup(&self) -> ViewState {
        let view = {
            let mut state = self.inner.lock_state();
            state.view.close_popup();
            state.view.clone()
        };
        self.inner.publish_view(&view);
        view
    }

    pub fn toggle_add_panel(&self) -> ViewState {
        let camera = self.inner.camera.camera();
        let view = {
            let mut state = self.inner.lock_state();
            state.view.toggle_add_panel(&camera);
            state.view.clone()
        };
        self.inner.publish_view(&view);
        view
    }

    pub fn toggle_edit_panel(&self) -> Result<ViewState> {
        let view = {
            let mut guard = self.inner.lock_state();
            let state = &mut *guard;
            let feature = state
                .view
                .popup
                .id
                .as_deref()
                .and_then(|id| state.towers.get(id))
                .cloned();
            state.view.toggle_edit_panel(feature.as_ref())?;
            state.view.clone()
        };
        self.inner.publish_view(&view);
        Ok(view)
    }

    /// Panel submit: edits the tower named by the form id, or adds a new one.
    pub async fn submit_form(&self, form: TowerForm) -> Result<PointFeature> {
        let feature = form.to_feature()?;
        let stored = {
            let mut state = self.inner.lock_state();
            match form.id.as_deref().filter(|id| !id.is_empty()) {
                Some(id) => {
                    let stored = state.towers.edit(id, feature)?.clone();
                    state.view.nav.refresh(&stored);
                    state.view.finish_submit(true);
                    tracing::info!("✏️  Updated tower '{}'", stored.id);
                    stored
                }
                None => {
                    let stored = state.towers.add(feature)?.clone();
                    state.view.nav.append(&stored);
                    state.view.finish_submit(false);
                    tracing::info!("➕ Added tower '{}'", stored.id);
                    stored
                }
            }
        };

        self.render().await?;
        self.inner.publish_view(&self.view());
        Ok(stored)
    }

    /// Removes a tower and its navigation entry. An unknown id is an error and changes nothing.
    pub async fn delete(&self, id: &str) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            if !state.view.nav.contains(id) || state.towers.get(id).is_none() {
                tracing::warn!("⚠️  Delete requested for unknown tower '{}'", id);
                return Err(TowerNotFound(id.to_string()).into());
            }
            state.towers.delete(id)?;
            state.view.nav.remove(id)?;
            state.view.after_delete();
        }
        tracing::info!("🗑️  Deleted tower '{}'", id);

        self.render().await?;
        self.inner.publish_view(&self.view());
        Ok(())
    }

    pub async fn delete_selected(&self) -> Result<()> {
        let selected = self.inner.lock_state().view.popup.id.clone();
        match selected {
            Some(id) => self.delete(&id).await,
            None => bail!("No tower is selected"),
        }
    }

    /// Camera moved by the user in the browser.
    pub fn camera_moved(&self, camera: CameraState) -> Result<()> {
        camera.validate()?;
        self.inner.camera.jump_to(camera);
        Ok(())
    }

    /// Re-registers icons and replaces the tower source; starts the pulse on first use.
    pub async fn render(&self) -> Result<()> {
        let icon_refs = self.inner.lock_state().towers.icon_refs();
        let failures = self.inner.icons.load_missing(icon_refs).await;
        if !failures.is_empty() {
            tracing::warn!("⚠️  {} icon(s) could not be registered", failures.len());
        }

        let data = self.inner.lock_state().towers.renderable_geojson();
        if self.inner.style.sync_towers(data.clone())? {
            tracing::info!("🗼 Tower layers created");
        }
        let _ = self.inner.events.send(MapEvent::source(data));

        self.inner.pulse.start(Arc::new(LivePaint {
            style: Arc::clone(&self.inner.style),
            events: self.inner.events.clone(),
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TOWER_SOURCE_ID;
    use crate::towers::tests::sample;
    use tokio::sync::broadcast::error::TryRecvError;

    fn offline_store(features: Vec<PointFeature>) -> TowerStore {
        let mut store = TowerStore::new();
        for mut feature in features {
            feature.properties.icon_ref = String::new();
            store.add(feature).unwrap();
        }
        store
    }

    fn seeded_offline() -> TowerStore {
        offline_store(TowerStore::seeded().unwrap().features().to_vec())
    }

    fn session(store: TowerStore) -> (MapSession, broadcast::Receiver<MapEvent>) {
        let (sender, _) = broadcast::channel(100_000);
        let session = MapSession::new(SessionConfig::default(), store, sender).unwrap();
        let receiver = session.subscribe_events();
        (session, receiver)
    }

    fn drain(receiver: &mut broadcast::Receiver<MapEvent>) -> Vec<MapEvent> {
        let mut events = Vec::new();
        loop {
            match receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }

    fn arrivals(events: &[MapEvent]) -> Vec<String> {
        events
            .iter()
            .filter(|e| e.event_type == "arrival")
            .filter_map(|e| e.data.tower_id.clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn popup_appears_after_arrival() {
        let (session, mut events) = session(seeded_offline());
        session.select_tower("paris").await.unwrap();

        assert!(session.is_flying());
        assert!(session.view().popup.hidden);

        tokio::time::sleep(Duration::from_secs(30)).await;

        let view = session.view();
        assert!(!session.is_flying());
        assert!(!view.popup.hidden);
        assert!(!view.edit_hidden && !view.delete_hidden);
        assert_eq!(view.popup.title, "Eiffel Tower");
        assert_eq!(view.popup.id.as_deref(), Some("paris"));
        assert_eq!(arrivals(&drain(&mut events)), vec!["paris".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_flight_shows_only_the_latest_tower() {
        let store = offline_store(vec![
            sample("paris", "Eiffel Tower", 2.2945, 48.8582),
            sample("tokyo", "Tokyo Tower", 139.7454, 35.6586),
        ]);
        let (session, mut events) = session(store);

        session.select_tower("tokyo").await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        session.select_tower("paris").await.unwrap();
        tokio::time::sleep(Duration::from_secs(40)).await;

        assert_eq!(arrivals(&drain(&mut events)), vec!["paris".to_string()]);
        assert_eq!(session.view().popup.title, "Eiffel Tower");
        assert_eq!(session.camera().center, LngLat::new(2.2945, 48.8582));
    }

    #[tokio::test(start_paused = true)]
    async fn pin_click_reveals_popup_immediately() {
        let (session, _events) = session(seeded_offline());
        session.click_pin("paris").unwrap();

        let view = session.view();
        assert!(!view.popup.hidden);
        assert_eq!(view.popup.title, "Eiffel Tower");
        assert!(!session.is_flying());
    }

    #[tokio::test]
    async fn towers_without_coordinates_cannot_be_flown_to() {
        let mut nowhere = sample("nowhere", "Nowhere", 0.0, 0.0);
        nowhere.geometry.coordinates = None;
        let (session, _events) = session(offline_store(vec![nowhere]));

        assert!(session.select_tower("nowhere").await.is_err());
        assert!(session.click_pin("nowhere").is_err());
        assert!(!session.is_flying());
        assert!(session.select_tower("missing").await.is_err());
    }

    #[tokio::test]
    async fn delete_empties_store_and_navigation() {
        let (session, _events) = session(seeded_offline());
        session.delete("paris").await.unwrap();

        assert!(session.towers().is_empty());
        assert!(session.view().nav.entries().is_empty());
        assert!(session.view().popup.hidden);
    }

    #[tokio::test]
    async fn deleting_unknown_id_fails_without_changes() {
        let (session, _events) = session(seeded_offline());
        let err = session.delete("atlantis").await.unwrap_err();

        assert!(err.downcast_ref::<TowerNotFound>().is_some());
        assert_eq!(session.towers().len(), 1);
        assert_eq!(session.view().nav.entries().len(), 1);
        assert!(session.delete_selected().await.is_err());
    }

    #[tokio::test]
    async fn edit_round_trip_keeps_id_and_position() {
        let store = offline_store(vec![
            sample("paris", "Paris", 2.2945, 48.8582),
            sample("tokyo", "Tokyo Tower", 139.7454, 35.6586),
        ]);
        let (session, _events) = session(store);

        let mut form = TowerForm::from_feature(&session.tower("paris").unwrap());
        form.name = "Eiffel".to_string();
        session.submit_form(form).await.unwrap();

        let towers = session.towers();
        assert_eq!(towers[0].id, "paris");
        assert_eq!(towers[0].properties.name, "Eiffel");
        assert_eq!(towers[1].id, "tokyo");
        assert_eq!(session.view().nav.entries()[0].name, "Eiffel");
    }

    #[tokio::test]
    async fn add_parses_coordinate_text() {
        let (session, _events) = session(seeded_offline());
        let form = TowerForm {
            name: "Trocadero".to_string(),
            pitch: "40".to_string(),
            bearing: "0".to_string(),
            zoom: "14".to_string(),
            coordinates: "2.29, 48.86".to_string(),
            ..TowerForm::default()
        };
        let added = session.submit_form(form.clone()).await.unwrap();
        assert_eq!(added.coordinates(), Some(LngLat::new(2.29, 48.86)));
        assert!(!added.id.is_empty());

        let broken = TowerForm {
            name: "Nowhere".to_string(),
            coordinates: "not-a-number".to_string(),
            ..form
        };
        let stored = session.submit_form(broken).await.unwrap();
        assert_eq!(stored.coordinates(), None);

        assert_eq!(session.towers().len(), 3);
        assert_eq!(session.view().nav.entries().len(), 3);
        let source = &session.style().sources[TOWER_SOURCE_ID]["data"]["features"];
        assert_eq!(source.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn render_starts_pulse_once_and_builds_layers() {
        let (session, _events) = session(seeded_offline());
        session.render().await.unwrap();
        session.render().await.unwrap();

        assert!(session.is_pulsing());
        assert_eq!(session.style().layers.len(), 3);
    }

    #[tokio::test]
    async fn open_panel_follows_the_camera() {
        let (session, _events) = session(seeded_offline());
        session.toggle_add_panel();

        let moved = CameraState {
            center: LngLat::new(10.5, 20.25),
            zoom: 7.5,
            pitch: 30.0,
            bearing: 15.0,
        };
        session.camera_moved(moved).unwrap();

        let form = session.view().panel.form;
        assert_eq!(form.coordinates, "10.5, 20.25");
        assert_eq!(form.zoom, "7.5");
        assert!(session
            .camera_moved(CameraState {
                center: LngLat::new(500.0, 0.0),
                ..moved
            })
            .is_err());
    }

    #[tokio::test]
    async fn camera_tracking_sends_form_not_view() {
        let (session, mut events) = session(seeded_offline());
        session.toggle_add_panel();
        drain(&mut events);

        session
            .camera_moved(CameraState {
                center: LngLat::new(10.5, 20.25),
                zoom: 7.5,
                pitch: 30.0,
                bearing: 15.0,
            })
            .unwrap();

        let events = drain(&mut events);
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["camera", "form"]);
        let form = events[1].data.form.as_ref().unwrap();
        assert_eq!(form.coordinates, "10.5, 20.25");
        assert_eq!(form.pitch, "30");
    }

    #[tokio::test]
    async fn out_of_range_view_angles_are_rejected() {
        let (session, _events) = session(seeded_offline());
        let form = TowerForm {
            name: "Too close".to_string(),
            pitch: "40".to_string(),
            bearing: "0".to_string(),
            zoom: "1e21".to_string(),
            coordinates: "2.29, 48.86".to_string(),
            ..TowerForm::default()
        };
        assert!(session.submit_form(form).await.is_err());
        assert_eq!(session.towers().len(), 1);

        let before = session.camera();
        let deep = CameraState {
            zoom: 1e21,
            ..before
        };
        assert!(session.camera_moved(deep).is_err());
        let steep = CameraState {
            pitch: 120.0,
            ..before
        };
        assert!(session.camera_moved(steep).is_err());
        assert_eq!(session.camera(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn extreme_stored_zoom_still_arrives() {
        let mut deep = sample("deep", "Deep", 2.29, 48.86);
        deep.properties.zoom = 1e21;
        let (session, mut events) = session(offline_store(vec![deep]));

        session.select_tower("deep").await.unwrap();
        tokio::time::sleep(Duration::from_secs(90)).await;

        assert!(!session.is_flying());
        assert_eq!(arrivals(&drain(&mut events)), vec!["deep".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_panel_opens_on_the_selected_tower() {
        let (session, _events) = session(seeded_offline());
        assert!(session.toggle_edit_panel().is_err());

        session.click_pin("paris").unwrap();
        let view = session.toggle_edit_panel().unwrap();
        assert!(view.edit_mode);
        assert_eq!(view.panel.form.id.as_deref(), Some("paris"));

        let closed = session.toggle_edit_panel().unwrap();
        assert!(!closed.edit_mode);
        assert!(!closed.popup.hidden);
    }

    #[tokio::test]
    async fn closing_popup_hides_controls() {
        let (session, _events) = session(seeded_offline());
        session.click_pin("paris").unwrap();
        let view = session.close_popup();
        assert!(view.popup.hidden && view.edit_hidden && view.delete_hidden);
    }
}
