//! Manager server
//!
//! Ingest state, the membership/query handlers, and the socket-driven loop.
//! The autoscaling decisions themselves live in [`crate::policy`].

use crate::orchestrator::Orchestrator;
use crate::ManagerResult;
use nimbus_fabric::{bind_pull, bind_rep, Sender, SocketCache};
use nimbus_proto::messages::{ExecutorStatistics, KeySet, ThreadStatus};
use nimbus_proto::ports;
use nimbus_proto::{from_bytes, to_bytes};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Interval between autoscaling and upkeep rounds
pub const REPORT_PERIOD: Duration = Duration::from_secs(15);

/// A worker thread identity
pub type ThreadKey = (String, u32);

/// Static identity of the cluster manager
#[derive(Clone)]
pub struct ManagerConfig {
    pub ip: String,
}

/// Manager state and handlers, independent of socket wiring
pub struct Manager {
    pub config: ManagerConfig,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub sender: Arc<dyn Sender>,

    /// Most recent status per executor thread
    pub executor_statuses: HashMap<ThreadKey, ThreadStatus>,
    /// Nodes mid-departure: IP to threads still draining
    pub departing: HashMap<String, u32>,
    /// Scheduler-reported calls per function this round
    pub function_frequencies: HashMap<String, u64>,
    /// Executor-reported `(total runtime, call count)` per function
    pub function_runtimes: HashMap<String, (f64, u64)>,
    /// Blended `(mean latency, sample count)` per function
    pub latency_history: HashMap<String, (f64, u64)>,
    /// Start of the current scale-out grace period
    pub grace_start: Option<Instant>,

    pub(crate) rng: StdRng,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        orchestrator: Arc<dyn Orchestrator>,
        sender: Arc<dyn Sender>,
    ) -> Self {
        Self::with_rng(config, orchestrator, sender, StdRng::from_entropy())
    }

    /// Deterministic variant for policy tests
    pub fn with_rng(
        config: ManagerConfig,
        orchestrator: Arc<dyn Orchestrator>,
        sender: Arc<dyn Sender>,
        rng: StdRng,
    ) -> Self {
        Manager {
            config,
            orchestrator,
            sender,
            executor_statuses: HashMap::new(),
            departing: HashMap::new(),
            function_frequencies: HashMap::new(),
            function_runtimes: HashMap::new(),
            latency_history: HashMap::new(),
            grace_start: None,
            rng,
        }
    }

    /// Ingest a utilization report; departing nodes are ignored so their
    /// drain does not skew the averages downward
    pub fn handle_utilization(&mut self, status: ThreadStatus) {
        if self.departing.contains_key(&status.ip) {
            return;
        }
        tracing::info!(ip = %status.ip, tid = status.tid, utilization = status.utilization,
            pinned = status.functions.len(), "thread status");
        self.executor_statuses.insert(status.key(), status);
    }

    /// One thread on `ip` finished draining; remove the node once all have
    pub async fn handle_depart_done(&mut self, ip: String) {
        let Some(remaining) = self.departing.get_mut(&ip) else {
            tracing::debug!(ip = %ip, "depart-done from a node not departing");
            return;
        };
        *remaining = remaining.saturating_sub(1);

        if *remaining == 0 {
            self.departing.remove(&ip);
            tracing::info!(ip = %ip, "all threads drained; removing node");
            self.orchestrator.remove_node("function", &ip).await;
        }
    }

    /// Ingest a statistics batch from a scheduler or executor
    pub fn handle_statistics(&mut self, stats: ExecutorStatistics) {
        for fstat in stats.statistics {
            match fstat.runtime {
                Some(runtime) => {
                    let entry = self
                        .function_runtimes
                        .entry(fstat.fname)
                        .or_insert((0.0, 0));
                    entry.0 += runtime;
                    entry.1 += fstat.call_count;
                }
                None => {
                    *self.function_frequencies.entry(fstat.fname).or_insert(0) +=
                        fstat.call_count;
                }
            }
        }
    }

    /// Relayed churn request: `add:<kind>:<count>` or `remove:<kind>:<ip>`
    pub async fn handle_churn(&mut self, msg: &str) {
        let parts: Vec<&str> = msg.split(':').collect();
        match parts.as_slice() {
            ["add", kind, count] => {
                if let Ok(count) = count.parse::<usize>() {
                    tracing::info!(kind = *kind, count, "relaying add request");
                    self.orchestrator.add_nodes(kind, count).await;
                }
            }
            ["remove", kind, ip] => {
                self.orchestrator.remove_node(kind, ip).await;
            }
            _ => tracing::debug!(msg, "ignoring malformed churn request"),
        }
    }

    /// Reverse index from the current statuses: function to threads
    pub fn func_locations(&self) -> HashMap<String, Vec<ThreadKey>> {
        let mut locations: HashMap<String, Vec<ThreadKey>> = HashMap::new();
        for (key, status) in &self.executor_statuses {
            for fname in &status.functions {
                locations.entry(fname.clone()).or_default().push(key.clone());
            }
        }
        locations
    }
}

/// Socket-wired manager loop
pub struct ManagerServer {
    pub core: Manager,
}

/// The inbound channels of the cluster manager
pub struct ManagerChannels {
    pub restart_rx: tokio::sync::mpsc::UnboundedReceiver<(Vec<u8>, nimbus_fabric::ReplyHandle)>,
    pub churn_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    pub list_executors_rx:
        tokio::sync::mpsc::UnboundedReceiver<(Vec<u8>, nimbus_fabric::ReplyHandle)>,
    pub utilization_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    pub list_schedulers_rx:
        tokio::sync::mpsc::UnboundedReceiver<(Vec<u8>, nimbus_fabric::ReplyHandle)>,
    pub depart_done_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    pub statistics_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    pub pin_accept_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ManagerServer {
    /// Bind every well-known manager endpoint
    pub async fn bind(
        config: ManagerConfig,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> ManagerResult<(Self, ManagerChannels)> {
        let restart_rx = bind_rep(&ports::bind_address(ports::RESTART_PORT)).await?;
        let churn_rx = bind_pull(&ports::bind_address(ports::CHURN_PORT)).await?;
        let list_executors_rx =
            bind_rep(&ports::bind_address(ports::LIST_EXECUTORS_PORT)).await?;
        let utilization_rx =
            bind_pull(&ports::bind_address(ports::UTILIZATION_REPORT_PORT)).await?;
        let list_schedulers_rx =
            bind_rep(&ports::bind_address(ports::SCHEDULER_LIST_PORT)).await?;
        let depart_done_rx = bind_pull(&ports::bind_address(ports::EXECUTOR_DEPART_PORT)).await?;
        let statistics_rx = bind_pull(&ports::bind_address(ports::STATISTICS_REPORT_PORT)).await?;
        let pin_accept_rx = bind_pull(&ports::bind_address(ports::PIN_ACCEPT_PORT)).await?;

        let sender: Arc<dyn Sender> = Arc::new(SocketCache::new());
        let core = Manager::new(config, orchestrator, sender);

        Ok((
            ManagerServer { core },
            ManagerChannels {
                restart_rx,
                churn_rx,
                list_executors_rx,
                utilization_rx,
                list_schedulers_rx,
                depart_done_rx,
                statistics_rx,
                pin_accept_rx,
            },
        ))
    }

    /// Run the polling loop forever
    pub async fn run(mut self, mut channels: ManagerChannels) -> ManagerResult<()> {
        let mut tick = tokio::time::interval(nimbus_fabric::POLL_TIMEOUT);
        let mut last_round = Instant::now();

        loop {
            tokio::select! {
                Some((frame, reply)) = channels.restart_rx.recv() => {
                    let ip = from_bytes::<String>(&frame).unwrap_or_default();
                    let count = self.core.orchestrator.restart_count(&ip).await;
                    if let Ok(bytes) = to_bytes(&count) {
                        reply.send(bytes);
                    }
                }
                Some(frame) = channels.churn_rx.recv() => {
                    if let Ok(msg) = from_bytes::<String>(&frame) {
                        self.core.handle_churn(&msg).await;
                    }
                }
                Some((_frame, reply)) = channels.list_executors_rx.recv() => {
                    let keys = self.core.orchestrator.pod_ips("function").await;
                    if let Ok(bytes) = to_bytes(&KeySet { keys }) {
                        reply.send(bytes);
                    }
                }
                Some(frame) = channels.utilization_rx.recv() => {
                    if let Ok(status) = from_bytes::<ThreadStatus>(&frame) {
                        self.core.handle_utilization(status);
                    }
                }
                Some((_frame, reply)) = channels.list_schedulers_rx.recv() => {
                    let keys = self.core.orchestrator.pod_ips("scheduler").await;
                    if let Ok(bytes) = to_bytes(&KeySet { keys }) {
                        reply.send(bytes);
                    }
                }
                Some(frame) = channels.depart_done_rx.recv() => {
                    if let Ok(ip) = from_bytes::<String>(&frame) {
                        self.core.handle_depart_done(ip).await;
                    }
                }
                Some(frame) = channels.statistics_rx.recv() => {
                    if let Ok(stats) = from_bytes::<ExecutorStatistics>(&frame) {
                        self.core.handle_statistics(stats);
                    }
                }
                Some(_frame) = channels.pin_accept_rx.recv() => {
                    // Replication pins are fire-and-forget; accepts are
                    // drained so the port never backs up.
                }
                _ = tick.tick() => {}
            }

            if last_round.elapsed() >= REPORT_PERIOD {
                tracing::info!("checking hash ring...");
                self.core.check_hash_ring().await;
                tracing::info!("checking for extra nodes...");
                self.core.check_unused_nodes().await;
                self.core.check_executor_utilization().await;
                self.core.check_function_load().await;

                self.core.function_runtimes.clear();
                self.core.function_frequencies.clear();
                last_round = Instant::now();
            }
        }
    }
}
