mod av;
mod client;
mod config;
mod encoder;
mod peer;
mod registry;
mod signaling;
mod web;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::registry::SessionRegistry;
use crate::web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // DEBUG is peeked before full config parsing so that parse warnings
    // themselves land in an initialized subscriber.
    let debug = std::env::var("DEBUG")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if debug { "debug" } else { "info" })
        }))
        .init();

    let config = Arc::new(ServerConfig::from_env());

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        registry: Arc::new(SessionRegistry::new()),
    });

    let app = web::build_router(Arc::clone(&state)).layer(TraceLayer::new_for_http());

    let bind_addr: SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .context("Invalid bind address")?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!("===========================================");
    tracing::info!("  Castpipe AV ingest server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Listening on ws://{bind_addr}/ws");
    if config.auth_key.is_empty() {
        tracing::warn!("  AUTH_KEY is empty, accepting all clients");
    }
    tracing::info!("===========================================");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down");
                }
            }
        })
        .await
        .context("Server error")?;

    // Stop every live session so encoder children are reaped before exit
    state.registry.close_all().await;
    tracing::info!("Castpipe server shut down cleanly");

    Ok(())
}
