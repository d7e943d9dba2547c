//! # hydrosnap-server
//!
//! HTTP server for HydroSnap site presence verification.
//!
//! This binary provides:
//! - REST API for QR validation, device location reports and geofence monitoring
//! - OpenAPI document at `/api/openapi.json`
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package hydrosnap-server
//!
//! # Production
//! HYDROSNAP__SERVER__PRODUCTION=true ./hydrosnap-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use anyhow::Context;
use hydrosnap_core::Config;
use hydrosnap_server::api;
use hydrosnap_server::logging;
use hydrosnap_server::state::AppState;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;

    logging::init(config.server.production)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        production = config.server.production,
        "Starting hydrosnap-server"
    );

    config.validate().context("Invalid configuration")?;

    let bind_address = config.server.bind_address.clone();
    let state = AppState::from_config(config)?.shared();

    let app = api::create_router(state.clone());

    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;

    info!("Listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown().await;
    info!("hydrosnap-server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
