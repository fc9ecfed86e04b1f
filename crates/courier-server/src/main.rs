//! # courier-server
//!
//! Message routing core of the Courier messenger.
//!
//! This binary provides:
//! - **Signal path**: verify, persist and fan out client envelopes to every
//!   connected device, with tiered offline push for the rest
//! - **Thread state**: SOLO threads and admin-governed GROUP threads, with
//!   every mutation serialized by a lease in the shared database
//! - **Delivery state**: per-session receipt, per-user seen and soft-delete
//!   sets with paged backfill for reconnecting devices
//! - **REST API** (axum) plus a websocket for real-time delivery
//! - **Per-caller rate limiting** to protect against abuse

mod api;
mod auth;
mod config;
mod contacts;
mod error;
mod events;
mod fanout;
mod lock;
mod messaging;
mod notify;
mod protocol;
mod push;
mod rate_limit;
mod registry;
mod store;
mod tasks;
mod threads;
mod users;
mod ws;

#[cfg(test)]
mod testkit;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier_shared::types::now_millis;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::push::{HttpPushGateway, LogOnlyGateway, PushGateway};
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    info!("Starting Courier server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store = Store::open(config.database_path.as_deref())?;

    let gateway: Arc<dyn PushGateway> = match &config.push_gateway_url {
        Some(url) => Arc::new(HttpPushGateway::new(
            url.clone(),
            config.push_gateway_key.clone(),
        )?),
        None => {
            warn!("PUSH_GATEWAY_URL not set, offline pushes will only be logged");
            Arc::new(LogOnlyGateway)
        }
    };

    let http_addr = config.http_addr;
    let lease_sweep = config.lock_ttl.max(std::time::Duration::from_secs(1));
    let (app_state, workers) = AppState::new(config, store.clone(), gateway);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    workers.spawn();

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = app_state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
        }
    });

    // Expired leases left behind by crashed holders
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(lease_sweep);
        loop {
            interval.tick().await;
            match store.call(|db| db.purge_expired_leases(now_millis())) {
                Ok(0) => {}
                Ok(purged) => info!(purged, "Purged expired leases"),
                Err(e) => warn!(error = %e, "Lease purge failed"),
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
