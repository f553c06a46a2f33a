//! shelf entry point.
//!
//! Boots the caching proxy: loads configuration, opens the cache database,
//! starts the HTTP front end and drives the generation lifecycle. Logs are
//! JSON on stderr.

use std::sync::Arc;

use anyhow::Result;
use shelf_client::{FetchClient, FetchConfig};
use shelf_core::{AppConfig, CacheDb, SqliteRegistry};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod clients;
mod control;
mod error;
mod lifecycle;
mod proxy;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load()?;
    tracing::info!(
        generation = %config.generation_id,
        version = %config.version,
        origin = %config.origin,
        listen = %config.listen_addr,
        db = %config.db_path.display(),
        "starting shelf"
    );

    let db = CacheDb::open(&config.db_path).await?;
    let registry = Arc::new(SqliteRegistry::new(db));
    let network = Arc::new(FetchClient::new(FetchConfig::from_app(&config)?)?);
    let state = Arc::new(proxy::AppState::from_config(&config, registry, network)?);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    let app = proxy::router(state.clone());
    let mut server =
        tokio::spawn(async move { axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await });

    tokio::select! {
        result = state.run_lifecycle() => {
            if let Err(e) = result {
                server.abort();
                return Err(e.into());
            }
        }
        result = &mut server => {
            result??;
            return Ok(());
        }
    }

    server.await??;
    tracing::info!("shelf stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown requested");
}
