mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use tally_api::state::AppStateInner;
use tally_gateway::health::run_health_sweep;
use tally_gateway::registry::Registry;
use tally_gateway::service::SessionService;
use tally_store::SessionStore;
use tally_store::backend::SessionBackend;
use tally_store::memory::MemoryBackend;
use tally_store::presence::PresenceTracker;
use tally_store::rules::OpaqueTemplates;
use tally_store::sqlite::SqliteBackend;

use crate::config::{ServerConfig, StoreKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally=debug,tally_gateway=debug,tally_store=info,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let backend: Arc<dyn SessionBackend> = match config.store {
        StoreKind::Memory => Arc::new(MemoryBackend::new()),
        StoreKind::Sqlite => Arc::new(SqliteBackend::open(&config.db_path)?),
    };
    info!(store = ?config.store, "session backend ready");

    let store = Arc::new(SessionStore::new(
        backend,
        PresenceTracker::new(config.presence.clone()),
        config.store_config.clone(),
    ));
    let registry = Registry::new(
        config.gateway.max_connections_per_session,
        config.gateway.channel_capacity,
    );
    let service = SessionService::new(store, registry.clone(), Arc::new(OpaqueTemplates));

    tokio::spawn(run_health_sweep(
        registry,
        config.gateway.sweep_interval,
        config.gateway.socket_timeout,
    ));

    let app = tally_api::router(AppStateInner::new(service, config.gateway.clone()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("tally listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
