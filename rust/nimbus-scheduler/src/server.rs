//! Scheduler server
//!
//! Process-local placement state plus the socket-driven polling loop over
//! the client-facing reply endpoints and the ingest channels.

use nimbus_fabric::{bind_pull, bind_rep, Sender, SocketCache};
use nimbus_kvs::KvsClient;
use nimbus_proto::messages::{
    Backoff, Dag, DagCall, Function, FunctionCall, FunctionList, SchedulerStatus, ThreadStatus,
};
use nimbus_proto::ports;
use nimbus_proto::{from_bytes, to_bytes};
use nimbus_registry::Registry;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::SchedulerResult;

/// Interval between gossip rounds, statistics reports, and metadata refresh
pub const GOSSIP_PERIOD: Duration = Duration::from_secs(5);

/// A worker thread identity
pub type ThreadKey = (String, u32);

/// Static identity of one scheduler replica
#[derive(Clone)]
pub struct SchedulerConfig {
    pub ip: String,
    pub mgmt_ip: String,
    pub route_addr: String,
}

/// Scheduler state and handlers, independent of socket wiring
pub struct Scheduler {
    pub config: SchedulerConfig,
    pub kvs: Arc<dyn KvsClient>,
    pub registry: Registry,
    pub sender: Arc<dyn Sender>,

    /// Known DAGs with their precomputed source sets
    pub dags: HashMap<String, (Dag, Vec<String>)>,
    /// Most recent status per worker thread
    pub thread_statuses: HashMap<ThreadKey, ThreadStatus>,
    /// Where each function is pinned
    pub func_locations: HashMap<String, HashSet<ThreadKey>>,
    /// Every live worker thread
    pub executors: HashSet<ThreadKey>,
    /// key -> worker IPs that have it cached, from the per-executor indices
    pub key_ip_map: HashMap<String, Vec<String>>,
    /// Recent placement timestamps per thread, for the soft load cap
    pub running_counts: HashMap<ThreadKey, Vec<Instant>>,
    /// Threads held out of placement after a backoff signal
    pub backoff: HashMap<ThreadKey, Instant>,
    /// Calls per DAG function since the last statistics report
    pub call_frequency: HashMap<String, u64>,
    /// Peer scheduler IPs, refreshed from the cluster manager
    pub schedulers: Vec<String>,
    /// Arrival time of the last status per thread, for duplicate suppression
    pub status_seen: HashMap<ThreadKey, Instant>,

    pub(crate) rng: StdRng,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, kvs: Arc<dyn KvsClient>, sender: Arc<dyn Sender>) -> Self {
        Self::with_rng(config, kvs, sender, StdRng::from_entropy())
    }

    /// Deterministic variant for placement tests
    pub fn with_rng(
        config: SchedulerConfig,
        kvs: Arc<dyn KvsClient>,
        sender: Arc<dyn Sender>,
        rng: StdRng,
    ) -> Self {
        Scheduler {
            registry: Registry::new(kvs.clone()),
            kvs,
            sender,
            config,
            dags: HashMap::new(),
            thread_statuses: HashMap::new(),
            func_locations: HashMap::new(),
            executors: HashSet::new(),
            key_ip_map: HashMap::new(),
            running_counts: HashMap::new(),
            backoff: HashMap::new(),
            call_frequency: HashMap::new(),
            schedulers: Vec::new(),
            status_seen: HashMap::new(),
            rng,
        }
    }

    /// Expire backoff entries and old placement timestamps
    pub fn housekeeping(&mut self) {
        let now = Instant::now();

        for timestamps in self.running_counts.values_mut() {
            timestamps.retain(|t| now.duration_since(*t) < crate::placement::RUNNING_COUNT_WINDOW);
        }
        self.running_counts.retain(|_, t| !t.is_empty());

        self.backoff
            .retain(|_, since| now.duration_since(*since) < crate::placement::BACKOFF_WINDOW);
    }
}

/// Socket-wired scheduler loop
pub struct SchedulerServer {
    pub core: Scheduler,
}

/// The inbound channels of one scheduler replica
pub struct SchedulerChannels {
    pub connect_rx: tokio::sync::mpsc::UnboundedReceiver<(Vec<u8>, nimbus_fabric::ReplyHandle)>,
    pub func_create_rx: tokio::sync::mpsc::UnboundedReceiver<(Vec<u8>, nimbus_fabric::ReplyHandle)>,
    pub func_call_rx: tokio::sync::mpsc::UnboundedReceiver<(Vec<u8>, nimbus_fabric::ReplyHandle)>,
    pub list_rx: tokio::sync::mpsc::UnboundedReceiver<(Vec<u8>, nimbus_fabric::ReplyHandle)>,
    pub dag_create_rx: tokio::sync::mpsc::UnboundedReceiver<(Vec<u8>, nimbus_fabric::ReplyHandle)>,
    pub dag_call_rx: tokio::sync::mpsc::UnboundedReceiver<(Vec<u8>, nimbus_fabric::ReplyHandle)>,
    pub status_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    pub sched_update_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    pub backoff_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    pub pin_accept_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
}

impl SchedulerServer {
    /// Bind every well-known scheduler endpoint
    pub async fn bind(
        config: SchedulerConfig,
        kvs: Arc<dyn KvsClient>,
    ) -> SchedulerResult<(Self, SchedulerChannels)> {
        let connect_rx = bind_rep(&ports::bind_address(ports::CONNECT_PORT)).await?;
        let func_create_rx = bind_rep(&ports::bind_address(ports::FUNC_CREATE_PORT)).await?;
        let func_call_rx = bind_rep(&ports::bind_address(ports::FUNC_CALL_PORT)).await?;
        let list_rx = bind_rep(&ports::bind_address(ports::LIST_PORT)).await?;
        let dag_create_rx = bind_rep(&ports::bind_address(ports::DAG_CREATE_PORT)).await?;
        let dag_call_rx = bind_rep(&ports::bind_address(ports::DAG_CALL_PORT)).await?;
        let status_rx = bind_pull(&ports::bind_address(ports::STATUS_PORT)).await?;
        let sched_update_rx = bind_pull(&ports::bind_address(ports::SCHED_UPDATE_PORT)).await?;
        let backoff_rx = bind_pull(&ports::bind_address(ports::BACKOFF_PORT)).await?;
        let pin_accept_rx = bind_pull(&ports::bind_address(ports::PIN_ACCEPT_PORT)).await?;

        let sender: Arc<dyn Sender> = Arc::new(SocketCache::new());
        let core = Scheduler::new(config, kvs, sender);

        Ok((
            SchedulerServer { core },
            SchedulerChannels {
                connect_rx,
                func_create_rx,
                func_call_rx,
                list_rx,
                dag_create_rx,
                dag_call_rx,
                status_rx,
                sched_update_rx,
                backoff_rx,
                pin_accept_rx,
            },
        ))
    }

    /// Run the polling loop forever
    pub async fn run(mut self, mut channels: SchedulerChannels) -> SchedulerResult<()> {
        self.core.refresh_cluster_state().await;
        let mut tick = tokio::time::interval(nimbus_fabric::POLL_TIMEOUT);
        let mut last_gossip = Instant::now();

        loop {
            tokio::select! {
                Some((_frame, reply)) = channels.connect_rx.recv() => {
                    if let Ok(bytes) = to_bytes(&self.core.config.route_addr) {
                        reply.send(bytes);
                    }
                }
                Some((frame, reply)) = channels.func_create_rx.recv() => {
                    if let Ok(func) = from_bytes::<Function>(&frame) {
                        let response = self.core.create_function(func).await;
                        if let Ok(bytes) = to_bytes(&response) {
                            reply.send(bytes);
                        }
                    }
                }
                Some((frame, reply)) = channels.func_call_rx.recv() => {
                    if let Ok(call) = from_bytes::<FunctionCall>(&frame) {
                        let response = self.core.call_function(call);
                        if let Ok(bytes) = to_bytes(&response) {
                            reply.send(bytes);
                        }
                    }
                }
                Some((frame, reply)) = channels.list_rx.recv() => {
                    let prefix = from_bytes::<String>(&frame).unwrap_or_default();
                    let names = self
                        .core
                        .registry
                        .list_functions(&prefix)
                        .await
                        .unwrap_or_default();
                    if names.is_empty() {
                        tracing::info!("function list is empty");
                    }
                    if let Ok(bytes) = to_bytes(&FunctionList { names }) {
                        reply.send(bytes);
                    }
                }
                Some((frame, reply)) = channels.dag_create_rx.recv() => {
                    if let Ok(dag) = from_bytes::<Dag>(&frame) {
                        let response = self
                            .core
                            .create_dag(dag, &mut channels.pin_accept_rx)
                            .await;
                        if let Ok(bytes) = to_bytes(&response) {
                            reply.send(bytes);
                        }
                    }
                }
                Some((frame, reply)) = channels.dag_call_rx.recv() => {
                    if let Ok(call) = from_bytes::<DagCall>(&frame) {
                        let response = self.core.call_dag(call);
                        if let Ok(bytes) = to_bytes(&response) {
                            reply.send(bytes);
                        }
                    }
                }
                Some(frame) = channels.status_rx.recv() => {
                    if let Ok(status) = from_bytes::<ThreadStatus>(&frame) {
                        self.core.handle_thread_status(status);
                    }
                }
                Some(frame) = channels.sched_update_rx.recv() => {
                    if let Ok(status) = from_bytes::<SchedulerStatus>(&frame) {
                        self.core.handle_scheduler_status(status).await;
                    }
                }
                Some(frame) = channels.backoff_rx.recv() => {
                    if let Ok(signal) = from_bytes::<Backoff>(&frame) {
                        self.core.handle_backoff(signal);
                    }
                }
                _ = tick.tick() => {}
            }

            self.core.housekeeping();

            if last_gossip.elapsed() >= GOSSIP_PERIOD {
                self.core.refresh_cluster_state().await;
                self.core.emit_gossip();
                self.core.report_statistics();
                last_gossip = Instant::now();
            }
        }
    }
}
