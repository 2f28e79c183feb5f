use gridnode::config::GridConfig;
use gridnode::node::Node;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "gridnode.toml".to_string());
    let config = GridConfig::load(&path)?;
    info!(config = %path, node = %config.uuid, "configuration loaded");

    let node = Node::spawn(config).await?;
    info!(
        node = %node.id,
        adapters = node.adapters.len(),
        "gridnode running, press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
