#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use crierd::config::{Args, ServerConfig};
use crierd::engine::{Engine, EngineCommand};
use crierd::metrics::{start_metrics_server, HealthState};
use crierd::server::ServerState;
use crierd::store::{EventStore, SqliteStore, WhitelistStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config: ServerConfig = args.into();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    // Store connectivity is the one fatal failure: exit nonzero before
    // accepting any connection.
    let store = SqliteStore::open(&config.store)
        .with_context(|| format!("opening store {}", config.store))?;
    if config.seed {
        store.seed_default_admin().await.context("seeding store")?;
        info!("seeded default admin whitelist entry");
    }
    let store = Arc::new(store);
    let whitelist: Arc<dyn WhitelistStore> = store.clone();
    let events: Arc<dyn EventStore> = store;

    let (engine, engine_tx) = Engine::new(config.clone(), whitelist, events);
    tokio::spawn(engine.run());

    let state = Arc::new(ServerState::new(config.clone(), engine_tx.clone()));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let health_state = HealthState::new();
    tokio::spawn({
        let health_state = health_state.clone();
        let metrics_addr = config.metrics_addr;
        async move {
            if let Err(e) = start_metrics_server(metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    tokio::select! {
        result = crierd::run(listener, state) => {
            if let Err(e) = result {
                tracing::error!("server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    // Cooperative shutdown: every open transport gets a going-away close
    // before the process exits.
    let _ = engine_tx.send(EngineCommand::Shutdown).await;

    Ok(())
}
