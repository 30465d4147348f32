//! Packmule master daemon entry point.

mod config;

use std::sync::Arc;

use packmule_master::{MasterConfig, MasterService};
use packmule_server::{ServerConfig, WsServer};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting packmule master"
    );

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = config::Config::load(config_path)?;
    if config.token_secret.is_empty() {
        anyhow::bail!("token_secret must be set in the configuration");
    }
    if config.storage_nodes.is_empty() {
        tracing::warn!("no storage nodes configured; every allocation will fail with 503");
    }
    tracing::info!(
        port = config.port,
        storage_nodes = config.storage_nodes.len(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))?;

    tracing::info!("master shut down cleanly");
    Ok(())
}

async fn run(config: config::Config) -> anyhow::Result<()> {
    let service = MasterService::new(MasterConfig {
        port: config.port,
        storage_nodes: config.storage_nodes,
        token_secret: config.token_secret,
    });

    let server = WsServer::bind(ServerConfig { port: config.port }, service).await?;
    let runner = Arc::clone(&server);
    let run_handle = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    server.shutdown();
    run_handle.await??;
    Ok(())
}
