//! Cluster manager entrypoint
//!
//! Binds the management endpoints and runs the autoscaling loop. Node
//! provisioning is relayed to the orchestration layer's add/remove
//! endpoints; set NODE_ADD_ADDR / NODE_REMOVE_ADDR to point at them.

use nimbus_fabric::SocketCache;
use nimbus_manager::orchestrator::RelayOrchestrator;
use nimbus_manager::{ManagerConfig, ManagerServer};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let my_ip = std::env::var("MY_IP").unwrap_or_else(|_| "127.0.0.1".to_string());
    let add_addr =
        std::env::var("NODE_ADD_ADDR").unwrap_or_else(|_| "127.0.0.1:7100".to_string());
    let remove_addr =
        std::env::var("NODE_REMOVE_ADDR").unwrap_or_else(|_| "127.0.0.1:7101".to_string());

    let sender = Arc::new(SocketCache::new());
    let orchestrator = Arc::new(RelayOrchestrator::new(sender, add_addr, remove_addr));

    let (server, channels) =
        ManagerServer::bind(ManagerConfig { ip: my_ip }, orchestrator).await?;
    tracing::info!("cluster manager started");
    server.run(channels).await?;
    Ok(())
}
