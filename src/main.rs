//! towerd - centralized request-rate policing and IP ban management.
//!
//! A small self-hosted daemon that co-located applications call to log
//! request events and receive escalating enforcement decisions per
//! source IP, with durable bans and subscriber notifications.

mod config;
mod db;
mod http;
mod limiter;
mod metrics;
mod notify;

use crate::config::{Config, generate_token};
use crate::db::Database;
use crate::http::AppState;
use crate::limiter::{Limiter, spawn_cleanup_task};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tower.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;
    config.limits.validate()?;

    info!(
        addr = %config.listen.addr,
        db = %config.database.path,
        request_limit = config.limits.request_limit,
        request_window_secs = config.limits.request_window_secs,
        "Starting towerd"
    );

    metrics::init();

    // Open the ban store and hydrate the in-memory mirror
    let db = Database::new(&config.database.path).await?;
    let limiter = Arc::new(Limiter::new(config.limits.clone(), db));
    let loaded = limiter.load_bans().await?;
    info!(bans = loaded, "Ban cache hydrated");

    let admin_token = config.admin.token.clone().unwrap_or_else(|| {
        let token = generate_token(32);
        info!(token = %token, "Generated ephemeral admin token; set [admin].token to pin it");
        token
    });

    let shutdown = CancellationToken::new();
    spawn_cleanup_task(
        Arc::clone(&limiter),
        config.cleanup.interval(),
        shutdown.clone(),
    );

    let addr: SocketAddr = config.listen.addr.parse()?;
    let state = AppState {
        limiter,
        admin_token,
    };

    let server = tokio::spawn(http::run_server(addr, state, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();
    let _ = server.await;

    Ok(())
}
