//! Scheduler entrypoint
//!
//! One process per scheduler replica. Identity comes from the environment
//! (MY_IP, MGMT_IP, ROUTE_ADDR); the peer list is refreshed from the
//! cluster manager at runtime.

use nimbus_config::NodeConfig;
use nimbus_kvs::RemoteKvsClient;
use nimbus_scheduler::{SchedulerConfig, SchedulerServer};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let node = NodeConfig::from_env()?;
    let config = SchedulerConfig {
        ip: node.my_ip.clone(),
        mgmt_ip: node.mgmt_ip,
        route_addr: node.route_addr.clone(),
    };

    let kvs = Arc::new(RemoteKvsClient::new(node.route_addr, node.my_ip));
    let (mut server, channels) = SchedulerServer::bind(config, kvs).await?;
    server.core.schedulers = node.scheduler_ips;

    tracing::info!("scheduler started");
    server.run(channels).await?;
    Ok(())
}
