use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;

pub mod events;
pub mod handlers;
pub mod state;

use self::state::AppState;
use handlers::{
    click_tower, close_popup, delete_selected, delete_tower, get_camera, get_icon, get_settings,
    get_style, get_tower, get_towers, get_view, index_html, map_events_stream, report_camera,
    script_js, select_tower, style_css, submit_form, toggle_add_panel, toggle_edit_panel,
};

// Create the main application router
fn create_app(state: AppState) -> Router {
    // The event stream must not be buffered by compression
    let api = Router::new()
        .route("/", get(index_html))
        .route("/style.css", get(style_css))
        .route("/script.js", get(script_js))
        .route("/api/settings", get(get_settings))
        .route("/api/towers", get(get_towers))
        .route("/api/towers/:id", get(get_tower).delete(delete_tower))
        .route("/api/towers/:id/select", post(select_tower))
        .route("/api/towers/:id/click", post(click_tower))
        .route("/api/selected", delete(delete_selected))
        .route("/api/form", post(submit_form))
        .route("/api/panel/add", post(toggle_add_panel))
        .route("/api/panel/edit", post(toggle_edit_panel))
        .route("/api/popup/close", post(close_popup))
        .route("/api/camera", get(get_camera).post(report_camera))
        .route("/api/view", get(get_view))
        .route("/api/style", get(get_style))
        .route("/api/icon", get(get_icon))
        .layer(CompressionLayer::new());

    Router::new()
        .route("/api/events", get(map_events_stream))
        .merge(api)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

pub async fn start_server(state: AppState, port: u16) -> Result<()> {
    let app = create_app(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("   ✅ HTTP server started successfully at http://127.0.0.1:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("👋 Shutting down");
}
