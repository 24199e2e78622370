//! HTTP gateway
//!
//! The actix-web boundary: OpenAI-shaped JSON in, JSON or SSE or JSONL out.
//! All shared state hangs off [`AppState`], constructed once at startup and
//! handed to handlers by reference.

pub mod routes;

use std::sync::Arc;
use std::time::Instant;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use tokio::sync::RwLock;
use tracing::info;

use crate::batch::{drain, Orchestrator};
use crate::config::Config;
use crate::core::error::{GatewayError, Result};
use crate::core::registry::DriverRegistry;
use crate::core::types::ModelList;
use crate::storage::Store;

const DEFAULT_LISTEN_ADDR: &str = "http://127.0.0.1:3049";

/// Shared application state.
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<DriverRegistry>,
    pub store: Store,
    pub orchestrator: Orchestrator,
    /// Model list memo; the union of configured models, held for an hour.
    pub models: RwLock<Option<(Instant, ModelList)>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, registry: Arc<DriverRegistry>, store: Store) -> Self {
        let orchestrator = Orchestrator::new(store.clone(), registry.clone());
        Self {
            config,
            registry,
            store,
            orchestrator,
            models: RwLock::new(None),
        }
    }
}

/// Load config, open the store, start the drain, and serve until shutdown.
pub async fn run_server() -> Result<()> {
    let config = Arc::new(Config::load()?);
    let store = Store::open(&config.database_path(), config.database.max_connections).await?;
    let registry = Arc::new(DriverRegistry::new(config.clone()));

    drain::spawn(store.clone(), registry.clone());

    let listen = config
        .daemon
        .as_ref()
        .map(|d| d.listen_addr.clone())
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
    let (scheme, addr) = listen
        .split_once("://")
        .ok_or_else(|| GatewayError::Config(format!("listen address {listen:?} has no scheme")))?;
    if scheme != "http" {
        return Err(GatewayError::Config(format!(
            "unsupported listen protocol {scheme:?}"
        )));
    }

    let state = web::Data::new(AppState::new(config, registry, store));
    info!(addr = %listen, "listening");
    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(1 << 30))
            .app_data(web::JsonConfig::default().limit(32 << 20))
            .configure(routes::configure)
    })
    .bind(addr)?
    .run()
    .await?;
    Ok(())
}
