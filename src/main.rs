use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod constants;
mod map;
mod server;
mod session;
mod settings;
mod towers;
mod utils;
mod view;

use server::start_server;
use server::state::AppState;
use session::{MapSession, SessionConfig};
use settings::Settings;
use towers::TowerStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("towermap=info")),
        )
        .init();

    tracing::info!("🗼 TowerMap v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = Settings::config_path();
    let settings = Settings::load().context("Failed to load settings")?;
    if !config_path.exists() {
        // First run: leave an editable config next to the binary
        match settings.save() {
            Ok(()) => tracing::info!("📝 Wrote default settings to {}", config_path.display()),
            Err(e) => tracing::warn!("⚠️  Could not write default settings: {:#}", e),
        }
    }

    let towers = TowerStore::seeded().context("Failed to load seed towers")?;
    tracing::info!("📍 Loaded {} towers", towers.len());

    let (event_sender, _event_receiver) = tokio::sync::broadcast::channel(1024);
    let session = MapSession::new(SessionConfig::from(&settings), towers, event_sender)
        .context("Failed to create map session")?;

    // Icons and layers; a failed icon leaves the pin without an image
    if let Err(e) = session.render().await {
        tracing::error!("❌ Initial render failed: {:#}", e);
    }

    let port = settings.port;
    let auto_open = settings.auto_open_browser;
    let app_state = AppState {
        session,
        settings: Arc::new(Mutex::new(settings)),
    };

    if auto_open {
        let url = utils::map_url(port);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            if let Err(e) = utils::open_browser(&url) {
                tracing::warn!("⚠️  Failed to open browser: {}", e);
            }
        });
    }

    start_server(app_state, port).await?;

    Ok(())
}
