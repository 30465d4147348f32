//! Packmule storage node daemon entry point.

mod config;

use std::sync::Arc;

use packmule_server::{ServerConfig, WsServer};
use packmule_storage_node::StorageNode;
use tokio_util::sync::CancellationToken;
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
        "starting packmule storage node"
    );

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = config::Config::load(config_path)?;
    if config.token_secret.is_empty() {
        anyhow::bail!("token_secret must be set in the configuration");
    }
    tracing::info!(
        port = config.port,
        root = %config.root.display(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))?;

    tracing::info!("storage node shut down cleanly");
    Ok(())
}

async fn run(config: config::Config) -> anyhow::Result<()> {
    let storage_config = config.to_storage_config();
    let node = StorageNode::new(storage_config.clone());

    let server = WsServer::bind(ServerConfig { port: storage_config.port }, node).await?;

    let sweeper_cancel = CancellationToken::new();
    let sweeper = server.handler().spawn_sweeper(sweeper_cancel.clone());

    let runner = Arc::clone(&server);
    let run_handle = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    sweeper_cancel.cancel();
    server.shutdown();
    sweeper.await?;
    run_handle.await??;
    Ok(())
}
