//! Executor thread entrypoint
//!
//! One process per logical executor thread. Identity and wiring come from
//! the environment (MY_IP, MGMT_IP, ROUTE_ADDR, SCHED_IPS, THREAD_ID,
//! EXECUTOR_ISOLATION). The native invoker is linked here; deployments with
//! their own function format embed their own invoker and reuse the server.

use nimbus_config::NodeConfig;
use nimbus_executor::{ExecutorConfig, ExecutorServer, NativeInvoker};
use nimbus_kvs::RemoteKvsClient;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let node = NodeConfig::from_env()?;
    let config = ExecutorConfig {
        ip: node.my_ip.clone(),
        tid: node.thread_id,
        mgmt_ip: node.mgmt_ip.clone(),
        schedulers: node.scheduler_ips.clone(),
        isolation: node.isolation,
    };

    let kvs = Arc::new(RemoteKvsClient::new(node.route_addr, node.my_ip));
    let invoker = Arc::new(NativeInvoker::new());

    let (server, channels) = ExecutorServer::bind(config, kvs, invoker).await?;
    tracing::info!(tid = node.thread_id, "executor thread started");
    server.run(channels).await?;

    tracing::info!("executor thread departed");
    Ok(())
}
