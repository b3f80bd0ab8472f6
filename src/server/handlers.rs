use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, Json, Response, Sse},
};
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "frontend/"]
struct Asset;

use crate::map::camera::CameraState;
use crate::settings::Settings;
use crate::towers::{PointFeature, TowerNotFound};
use crate::view::{TowerForm, ViewState};

use super::events::MapEvent;
use super::state::AppState;

/// 404 for unknown towers, `fallback` for everything else.
fn status_for(e: &anyhow::Error, fallback: StatusCode) -> StatusCode {
    if e.downcast_ref::<TowerNotFound>().is_some() {
        StatusCode::NOT_FOUND
    } else {
        fallback
    }
}

fn log_failure(action: &str, e: &anyhow::Error, fallback: StatusCode) -> StatusCode {
    let status = status_for(e, fallback);
    if status.is_server_error() {
        tracing::error!("{} failed: {:#}", action, e);
    } else {
        tracing::warn!("{} rejected: {:#}", action, e);
    }
    status
}

// HTTP API Handlers
pub async fn get_settings(State(state): State<AppState>) -> Result<Json<Settings>, StatusCode> {
    let settings = state.settings.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(settings.clone()))
}

pub async fn get_towers(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.session.towers_geojson())
}

pub async fn get_tower(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<PointFeature>, StatusCode> {
    state.session.tower(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

pub async fn select_tower(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, StatusCode> {
    state
        .session
        .select_tower(&id)
        .await
        .map_err(|e| log_failure("Select tower", &e, StatusCode::BAD_REQUEST))?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn click_tower(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<ViewState>, StatusCode> {
    state
        .session
        .click_pin(&id)
        .map_err(|e| log_failure("Pin click", &e, StatusCode::BAD_REQUEST))?;
    Ok(Json(state.session.view()))
}

pub async fn delete_tower(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<ViewState>, StatusCode> {
    state
        .session
        .delete(&id)
        .await
        .map_err(|e| log_failure("Delete tower", &e, StatusCode::INTERNAL_SERVER_ERROR))?;
    Ok(Json(state.session.view()))
}

pub async fn delete_selected(State(state): State<AppState>) -> Result<Json<ViewState>, StatusCode> {
    state
        .session
        .delete_selected()
        .await
        .map_err(|e| log_failure("Delete selected tower", &e, StatusCode::BAD_REQUEST))?;
    Ok(Json(state.session.view()))
}

pub async fn submit_form(
    State(state): State<AppState>,
    Json(form): Json<TowerForm>,
) -> Result<Json<PointFeature>, StatusCode> {
    // Reject bad numbers before touching the session
    form.to_feature()
        .map_err(|e| log_failure("Tower form", &e, StatusCode::BAD_REQUEST))?;

    let stored = state
        .session
        .submit_form(form)
        .await
        .map_err(|e| log_failure("Tower form", &e, StatusCode::INTERNAL_SERVER_ERROR))?;
    Ok(Json(stored))
}

pub async fn toggle_add_panel(State(state): State<AppState>) -> Json<ViewState> {
    Json(state.session.toggle_add_panel())
}

pub async fn toggle_edit_panel(State(state): State<AppState>) -> Result<Json<ViewState>, StatusCode> {
    let view = state
        .session
        .toggle_edit_panel()
        .map_err(|e| log_failure("Edit panel", &e, StatusCode::BAD_REQUEST))?;
    Ok(Json(view))
}

pub async fn close_popup(State(state): State<AppState>) -> Json<ViewState> {
    Json(state.session.close_popup())
}

pub async fn report_camera(
    State(state): State<AppState>,
    Json(camera): Json<CameraState>,
) -> Result<StatusCode, StatusCode> {
    state
        .session
        .camera_moved(camera)
        .map_err(|e| log_failure("Camera report", &e, StatusCode::BAD_REQUEST))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_camera(State(state): State<AppState>) -> Json<CameraState> {
    Json(state.session.camera())
}

pub async fn get_view(State(state): State<AppState>) -> Json<ViewState> {
    Json(state.session.view())
}

pub async fn get_style(State(state): State<AppState>) -> Json<serde_json::Value> {
    let style = state.session.style();
    Json(serde_json::json!({
        "sources": style.sources,
        "layers": style.layers,
        "pulse": state.session.pulse_state(),
        "pulsing": state.session.is_pulsing(),
        "flying": state.session.is_flying(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct IconQuery {
    #[serde(rename = "ref")]
    pub reference: String,
}

pub async fn get_icon(
    State(state): State<AppState>,
    Query(query): Query<IconQuery>,
) -> Result<Response, StatusCode> {
    let icon = state.session.icon(&query.reference).ok_or(StatusCode::NOT_FOUND)?;
    Response::builder()
        .header(header::CONTENT_TYPE, "image/png")
        .header(header::CACHE_CONTROL, "public, max-age=3600")
        .body(icon.png.into())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// SSE endpoint for map events
pub async fn map_events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut event_receiver = state.session.subscribe_events();
    let (tx, rx) = tokio::sync::mpsc::channel(256);

    // Start every client from the current view
    let initial = MapEvent::view(&state.session.view());
    if let Ok(event) = SseEvent::default().json_data(&initial) {
        let _ = tx.send(Ok(event)).await;
    }

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = event_receiver.recv() => {
                    match event {
                        Ok(map_event) => {
                            let sse_event = SseEvent::default()
                                .json_data(&map_event)
                                .unwrap_or_else(|_| SseEvent::default().data("Error serializing event"));

                            if tx.send(Ok(sse_event)).await.is_err() {
                                break; // Client disconnected
                            }
                        }
                        // Slow client: skip what it missed, the next frame supersedes it
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!("SSE client lagged, skipped {} events", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(30)) => {
                    let sse_event = SseEvent::default()
                        .json_data(&MapEvent::heartbeat())
                        .unwrap_or_else(|_| SseEvent::default().data("Error serializing heartbeat"));

                    if tx.send(Ok(sse_event)).await.is_err() {
                        break; // Client disconnected
                    }
                }
            }
        }
    });

    let stream = ReceiverStream::new(rx);

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive-message"),
    )
}

// Helper struct for SSE events
use axum::response::sse::Event as SseEvent;

fn embedded(path: &str, content_type: &str) -> Result<Response, StatusCode> {
    let content = Asset::get(path).ok_or(StatusCode::NOT_FOUND)?.data;
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(content.into_owned().into())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

pub async fn index_html() -> Result<Html<Vec<u8>>, StatusCode> {
    let page = Asset::get("index.html").ok_or(StatusCode::NOT_FOUND)?;
    Ok(Html(page.data.into_owned()))
}

pub async fn style_css() -> Result<Response, StatusCode> {
    embedded("style.css", "text/css")
}

pub async fn script_js() -> Result<Response, StatusCode> {
    embedded("script.js", "application/javascript")
}
