//! The ripple sync server binary.
//!
//! Environment:
//! - `RIPPLE_WS_ADDR`   — WebSocket listener (default `127.0.0.1:9090`)
//! - `RIPPLE_HTTP_ADDR` — HTTP listener (default `127.0.0.1:8080`)
//! - `RIPPLE_DATA_DIR`  — store directory (default `ripple_data`)
//! - `RUST_LOG`         — log filter (env_logger)

use ripple_server::broadcast::ConnectionRegistry;
use ripple_server::http::{build_router, AppState};
use ripple_server::server::{ServerConfig, SyncServer};
use ripple_sync::engine::SyncEngine;
use ripple_sync::mutators::MutatorRegistry;
use ripple_sync::storage::{ObjectStore, StoreConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    let data_dir = std::env::var("RIPPLE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("ripple_data"));

    let store = Arc::new(ObjectStore::open(StoreConfig {
        path: data_dir,
        ..StoreConfig::default()
    })?);
    let engine = Arc::new(SyncEngine::new(store, MutatorRegistry::with_defaults()));
    let registry = Arc::new(ConnectionRegistry::new());

    let router = build_router(AppState {
        engine: engine.clone(),
        registry: registry.clone(),
    });
    let http_listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    log::info!("HTTP server listening on {}", config.http_addr);

    let ws_server = SyncServer::new(config, engine, registry);

    tokio::select! {
        result = axum::serve(http_listener, router) => {
            result?;
        }
        result = ws_server.run() => {
            result?;
        }
    }

    Ok(())
}
