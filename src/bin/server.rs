//! ICY relay server
//!
//! Usage: `icy-relay [CONFIG]`. Without an argument the config is read from
//! the platform config directory.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use icy_relay::{
    auth::{PasswordAuthenticator, SharedHooks},
    config::AppConfig,
    server::Server,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting ICY relay {}", env!("CARGO_PKG_VERSION"));

    let path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => AppConfig::default_path().context("No config file given and no config directory found")?,
    };
    let config = AppConfig::load(&path).with_context(|| format!("Failed to load config from {}", path.display()))?;
    tracing::info!("Loaded config from {}", path.display());

    let hooks: SharedHooks = Arc::new(PasswordAuthenticator::new(&config.passwords));
    let server = Server::bind(&config, hooks).await?;

    tracing::info!("Listeners: http://{}/", server.playback_addr());
    if let Some(addr) = server.source_addr() {
        tracing::info!("Sources: {}", addr);
    }
    if let Some(addr) = server.admin_addr() {
        tracing::info!("Admin API: http://{}/admin/status", addr);
    }

    let mut running = server.start();
    tokio::select! {
        result = running.wait() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }

    Ok(())
}
