//! Executor server
//!
//! One logical executor thread: process-local state, the event handlers for
//! schedules and triggers, periodic status reporting, and the socket-driven
//! polling loop.

use crate::call::PreparedSingle;
use crate::user_library::UserLibrary;
use crate::{ExecutorResult, Invoker};
use nimbus_config::IsolationMode;
use nimbus_fabric::{bind_pull, bind_rep, Sender, SocketCache};
use nimbus_kvs::{KvsClient, LwwPair};
use nimbus_proto::messages::{
    Backoff, DagSchedule, DagTrigger, FunctionCall, GenericResponse, PinRequest, ResponseError,
    StatusType, ThreadStatus, UnpinRequest,
};
use nimbus_proto::ports;
use nimbus_proto::{from_bytes, to_bytes};
use nimbus_registry::{cache_index_key, Registry};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Interval between periodic thread-status reports
pub const REPORT_PERIOD: Duration = Duration::from_secs(20);

/// In-flight schedule depth past which the thread signals backpressure
pub const BACKOFF_QUEUE_DEPTH: usize = 100;

/// What the polling loop should do after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    /// Drain complete or strong-isolation unpin; the process exits
    Exit,
}

/// Static identity and wiring of one executor thread
#[derive(Clone)]
pub struct ExecutorConfig {
    pub ip: String,
    pub tid: u32,
    pub mgmt_ip: String,
    pub schedulers: Vec<String>,
    pub isolation: IsolationMode,
}

/// Executor state and handlers, independent of socket wiring
pub struct Executor {
    pub config: ExecutorConfig,
    pub kvs: Arc<dyn KvsClient>,
    pub registry: Registry,
    pub invoker: Arc<dyn Invoker>,
    pub sender: Arc<dyn Sender>,
    pub user_library: Arc<UserLibrary>,

    pub status: ThreadStatus,
    /// Pinned function bodies
    pub pinned: HashMap<String, Vec<u8>>,
    /// Per pinned function: in-flight schedules by id
    pub queue: HashMap<String, HashMap<String, DagSchedule>>,
    /// Per function and schedule id: accumulated triggers in arrival order
    pub received_triggers: HashMap<String, HashMap<String, Vec<DagTrigger>>>,
    /// Cumulative user-code runtime per function since the last report
    pub runtimes: HashMap<String, f64>,
    /// Invocations per function since the last report
    pub exec_counts: HashMap<String, u64>,
    /// Keys this thread has resolved; persisted as the cache index
    pub cached_keys: HashSet<String>,

    pub departing: bool,
    event_occupancy: HashMap<&'static str, f64>,
    total_occupancy: f64,
    report_start: Instant,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        kvs: Arc<dyn KvsClient>,
        invoker: Arc<dyn Invoker>,
        sender: Arc<dyn Sender>,
        user_library: Arc<UserLibrary>,
    ) -> Self {
        let status = ThreadStatus {
            ip: config.ip.clone(),
            tid: config.tid,
            running: true,
            ..Default::default()
        };

        Executor {
            registry: Registry::new(kvs.clone()),
            kvs,
            invoker,
            sender,
            user_library,
            status,
            config,
            pinned: HashMap::new(),
            queue: HashMap::new(),
            received_triggers: HashMap::new(),
            runtimes: HashMap::new(),
            exec_counts: HashMap::new(),
            cached_keys: HashSet::new(),
            departing: false,
            event_occupancy: HashMap::new(),
            total_occupancy: 0.0,
            report_start: Instant::now(),
        }
    }

    /// Push the current thread status to every scheduler
    pub fn push_status(&mut self, kind: StatusType) {
        self.status.r#type = kind;
        let Ok(bytes) = to_bytes(&self.status) else { return };
        for scheduler in &self.config.schedulers {
            self.sender
                .send(&ports::status_address(scheduler), bytes.clone());
        }
    }

    /// Record a DAG schedule; fires immediately when the expected trigger
    /// set already accumulated (schedule-after-trigger race)
    pub fn handle_schedule(&mut self, schedule: DagSchedule) -> (GenericResponse, bool) {
        let fname = schedule.target_function.clone();
        tracing::info!(dag = %schedule.dag.name, function = %fname, id = %schedule.id,
            "received schedule");

        let right_ip = schedule
            .locations
            .get(&fname)
            .and_then(|loc| loc.split(':').next().map(|ip| ip == self.config.ip))
            .unwrap_or(false);

        if !self.status.running || !self.status.functions.contains(&fname) || !right_ip {
            return (GenericResponse::err(ResponseError::InvalidTarget), false);
        }

        let ready = self
            .received_triggers
            .get(&fname)
            .and_then(|by_id| by_id.get(&schedule.id))
            .map(|triggers| triggers.len() == schedule.triggers.len())
            .unwrap_or(false);

        self.queue
            .entry(fname)
            .or_default()
            .insert(schedule.id.clone(), schedule);

        (GenericResponse::ok(), ready)
    }

    /// Record a trigger; true when the target schedule is now ready to fire
    pub fn handle_trigger(&mut self, trigger: DagTrigger) -> bool {
        let fname = trigger.target_function.clone();
        let id = trigger.id.clone();

        let accumulated = self
            .received_triggers
            .entry(fname.clone())
            .or_default()
            .entry(id.clone())
            .or_default();
        accumulated.push(trigger);
        let count = accumulated.len();

        self.queue
            .get(&fname)
            .and_then(|by_id| by_id.get(&id))
            .map(|schedule| count == schedule.triggers.len())
            .unwrap_or(false)
    }

    /// Fire a ready schedule: remove its in-flight state and execute
    pub async fn fire(&mut self, fname: &str, id: &str) -> ExecutorResult<()> {
        let Some(schedule) = self.queue.get_mut(fname).and_then(|q| q.remove(id)) else {
            return Ok(());
        };
        let triggers = self
            .received_triggers
            .get_mut(fname)
            .and_then(|t| t.remove(id))
            .unwrap_or_default();

        let start = Instant::now();
        self.execute_dag_function(schedule, triggers).await?;
        let elapsed = start.elapsed().as_secs_f64();

        *self.runtimes.entry(fname.to_string()).or_insert(0.0) += elapsed;
        *self.exec_counts.entry(fname.to_string()).or_insert(0) += 1;
        Ok(())
    }

    /// Stop accepting work, announce the departure, and drain
    pub fn handle_self_depart(&mut self) {
        tracing::info!("preparing to depart; no longer accepting requests");
        self.departing = true;
        self.status.running = false;
        self.status.functions.clear();
        self.push_status(StatusType::PostRequest);
    }

    /// Accumulate time spent servicing one event
    pub fn record_occupancy(&mut self, event: &'static str, start: Instant) {
        let elapsed = start.elapsed().as_secs_f64();
        *self.event_occupancy.entry(event).or_insert(0.0) += elapsed;
        self.total_occupancy += elapsed;
    }

    /// True when the report interval has elapsed
    pub fn report_due(&self) -> bool {
        self.report_start.elapsed() >= REPORT_PERIOD
    }

    /// Total in-flight schedules across all pinned functions
    pub fn in_flight(&self) -> usize {
        self.queue.values().map(HashMap::len).sum()
    }

    /// Periodic reporting and housekeeping; `Exit` once a departure drains
    pub async fn report(&mut self) -> ExecutorResult<LoopAction> {
        let wall = self.report_start.elapsed().as_secs_f64();
        let utilization = if wall > 0.0 {
            self.total_occupancy / wall
        } else {
            0.0
        };
        self.status.utilization = utilization;
        tracing::info!(utilization, "thread occupancy");
        for (event, occupancy) in &self.event_occupancy {
            tracing::debug!(event = *event, occupancy = *occupancy, "event occupancy");
        }

        self.push_status(StatusType::Periodic);
        if let Ok(bytes) = to_bytes(&self.status) {
            self.sender.send(
                &ports::utilization_report_address(&self.config.mgmt_ip),
                bytes,
            );
        }

        let stats = self.drain_statistics();
        if !stats.statistics.is_empty() {
            if let Ok(bytes) = to_bytes(&stats) {
                self.sender.send(
                    &ports::statistics_report_address(&self.config.mgmt_ip),
                    bytes,
                );
            }
        }

        if self.in_flight() > BACKOFF_QUEUE_DEPTH {
            let signal = Backoff {
                ip: self.config.ip.clone(),
                tid: self.config.tid,
            };
            if let Ok(bytes) = to_bytes(&signal) {
                for scheduler in &self.config.schedulers {
                    self.sender
                        .send(&ports::backoff_address(scheduler), bytes.clone());
                }
            }
        }

        self.persist_cache_index().await;

        self.event_occupancy.clear();
        self.total_occupancy = 0.0;
        self.report_start = Instant::now();

        self.purge_stale();

        if self.departing && self.in_flight() == 0 {
            if let Ok(bytes) = to_bytes(&self.config.ip) {
                self.sender
                    .send(&ports::depart_done_address(&self.config.mgmt_ip), bytes);
            }
            return Ok(LoopAction::Exit);
        }

        Ok(LoopAction::Continue)
    }

    /// Per-function statistics since the last report, resetting the counters
    fn drain_statistics(&mut self) -> nimbus_proto::messages::ExecutorStatistics {
        let mut stats = nimbus_proto::messages::ExecutorStatistics::default();
        for (fname, count) in self.exec_counts.drain() {
            if count == 0 {
                continue;
            }
            stats.statistics.push(nimbus_proto::messages::FunctionStatistics {
                fname: fname.clone(),
                call_count: count,
                runtime: self.runtimes.get(&fname).copied(),
            });
        }
        for count in self.runtimes.values_mut() {
            *count = 0.0;
        }
        stats
    }

    /// Advertise which keys this node holds so schedulers can place for
    /// locality
    async fn persist_cache_index(&self) {
        if self.cached_keys.is_empty() {
            return;
        }
        let mut keys: Vec<String> = self.cached_keys.iter().cloned().collect();
        keys.sort();
        let Ok(payload) = bincode::serialize(&keys) else { return };
        if let Err(err) = self
            .kvs
            .put(
                &cache_index_key(&self.config.ip),
                LwwPair::now(self.config.tid, payload),
            )
            .await
        {
            tracing::debug!("cache index write failed: {err}");
        }
    }

    /// Drop queue and trigger state for functions that are no longer pinned
    /// and have nothing in flight
    fn purge_stale(&mut self) {
        let pinned: HashSet<String> = self.status.functions.iter().cloned().collect();

        let stale: Vec<String> = self
            .queue
            .iter()
            .filter(|(fname, by_id)| by_id.is_empty() && !pinned.contains(*fname))
            .map(|(fname, _)| fname.clone())
            .collect();

        for fname in stale {
            self.queue.remove(&fname);
            self.received_triggers.remove(&fname);
            self.pinned.remove(&fname);
            self.runtimes.remove(&fname);
            self.exec_counts.remove(&fname);
        }

        self.received_triggers
            .retain(|fname, by_id| !by_id.is_empty() || pinned.contains(fname) || self.queue.contains_key(fname));
    }
}

/// Socket-wired executor loop
pub struct ExecutorServer {
    pub core: Executor,
}

impl ExecutorServer {
    /// Bind every per-thread endpoint and construct the server
    pub async fn bind(
        config: ExecutorConfig,
        kvs: Arc<dyn KvsClient>,
        invoker: Arc<dyn Invoker>,
    ) -> ExecutorResult<(Self, ExecutorChannels)> {
        let tid = config.tid as u16;
        let pin_rx = bind_pull(&ports::bind_address(ports::PIN_PORT + tid)).await?;
        let unpin_rx = bind_pull(&ports::bind_address(ports::UNPIN_PORT + tid)).await?;
        let exec_rx = bind_rep(&ports::bind_address(ports::FUNC_EXEC_PORT + tid)).await?;
        let queue_rx = bind_rep(&ports::bind_address(ports::DAG_QUEUE_PORT + tid)).await?;
        let trigger_rx = bind_pull(&ports::bind_address(ports::DAG_EXEC_PORT + tid)).await?;
        let depart_rx = bind_pull(&ports::bind_address(ports::SELF_DEPART_PORT + tid)).await?;

        let sender: Arc<dyn Sender> = Arc::new(SocketCache::new());
        let user_library =
            UserLibrary::bind(config.ip.clone(), config.tid, kvs.clone(), sender.clone()).await?;

        let core = Executor::new(config, kvs, invoker, sender, user_library);
        let channels = ExecutorChannels {
            pin_rx,
            unpin_rx,
            exec_rx,
            queue_rx,
            trigger_rx,
            depart_rx,
        };
        Ok((ExecutorServer { core }, channels))
    }

    /// Run the polling loop until departure or strong-isolation restart
    pub async fn run(mut self, mut channels: ExecutorChannels) -> ExecutorResult<()> {
        self.core.push_status(StatusType::Periodic);
        let mut tick = tokio::time::interval(nimbus_fabric::POLL_TIMEOUT);

        loop {
            tokio::select! {
                Some(frame) = channels.pin_rx.recv() => {
                    let start = Instant::now();
                    if let Ok(req) = from_bytes::<PinRequest>(&frame) {
                        self.core.handle_pin(req).await;
                        self.core.push_status(StatusType::PostRequest);
                    }
                    self.core.record_occupancy("pin", start);
                }
                Some(frame) = channels.unpin_rx.recv() => {
                    let start = Instant::now();
                    if let Ok(req) = from_bytes::<UnpinRequest>(&frame) {
                        if self.core.handle_unpin(&req.name) == LoopAction::Exit {
                            return Ok(());
                        }
                        self.core.push_status(StatusType::PostRequest);
                    }
                    self.core.record_occupancy("unpin", start);
                }
                Some((frame, reply)) = channels.exec_rx.recv() => {
                    let start = Instant::now();
                    if let Ok(call) = from_bytes::<FunctionCall>(&frame) {
                        let (response, prepared) = self.core.handle_exec_single(call).await;
                        if let Ok(bytes) = to_bytes(&response) {
                            reply.send(bytes);
                        }
                        if let Some(prepared) = prepared {
                            self.run_prepared(prepared).await;
                        }
                    }
                    self.core.record_occupancy("func_exec", start);
                }
                Some((frame, reply)) = channels.queue_rx.recv() => {
                    let start = Instant::now();
                    if let Ok(schedule) = from_bytes::<DagSchedule>(&frame) {
                        let fname = schedule.target_function.clone();
                        let id = schedule.id.clone();
                        let (response, ready) = self.core.handle_schedule(schedule);
                        if let Ok(bytes) = to_bytes(&response) {
                            reply.send(bytes);
                        }
                        if ready {
                            if let Err(err) = self.core.fire(&fname, &id).await {
                                tracing::warn!("firing {fname} for {id} failed: {err}");
                            }
                        }
                    }
                    self.core.record_occupancy("dag_queue", start);
                }
                Some(frame) = channels.trigger_rx.recv() => {
                    let start = Instant::now();
                    if let Ok(trigger) = from_bytes::<DagTrigger>(&frame) {
                        let fname = trigger.target_function.clone();
                        let id = trigger.id.clone();
                        if self.core.handle_trigger(trigger) {
                            if let Err(err) = self.core.fire(&fname, &id).await {
                                tracing::warn!("firing {fname} for {id} failed: {err}");
                            }
                        }
                    }
                    self.core.record_occupancy("dag_exec", start);
                }
                Some(_frame) = channels.depart_rx.recv() => {
                    self.core.handle_self_depart();
                }
                _ = tick.tick() => {}
            }

            if self.core.report_due() && self.core.report().await? == LoopAction::Exit {
                return Ok(());
            }
        }
    }

    async fn run_prepared(&mut self, prepared: PreparedSingle) {
        if let Err(err) = self.core.run_single(prepared).await {
            tracing::warn!("single-function execution failed: {err}");
        }
    }
}

/// The inbound channels of one executor thread
pub struct ExecutorChannels {
    pub pin_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    pub unpin_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    pub exec_rx: tokio::sync::mpsc::UnboundedReceiver<(Vec<u8>, nimbus_fabric::ReplyHandle)>,
    pub queue_rx: tokio::sync::mpsc::UnboundedReceiver<(Vec<u8>, nimbus_fabric::ReplyHandle)>,
    pub trigger_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    pub depart_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{arithmetic_invoker, executor_with, seed_function, MGMT_IP, SCHED_IP};
    use nimbus_config::IsolationMode;
    use nimbus_proto::args::literal;
    use nimbus_proto::messages::{Dag, ExecutorStatistics, PinRequest};

    async fn pinned(name: &str) -> (Executor, Arc<nimbus_fabric::testing::RecordingSender>) {
        let (mut executor, sender, _kvs) =
            executor_with(IsolationMode::Normal, Arc::new(arithmetic_invoker()));
        seed_function(&executor, name).await;
        executor
            .handle_pin(PinRequest {
                name: name.to_string(),
                response_address: SCHED_IP.to_string(),
            })
            .await;
        sender.clear();
        (executor, sender)
    }

    fn lonely_schedule(fname: &str, id: &str) -> DagSchedule {
        let dag = Dag {
            name: "lonely".to_string(),
            functions: vec![fname.to_string()],
            connections: Vec::new(),
        };
        let mut locations = HashMap::new();
        locations.insert(fname.to_string(), "10.0.0.1:0".to_string());
        let mut arguments = HashMap::new();
        arguments.insert(fname.to_string(), vec![literal(&1i64).unwrap()]);
        DagSchedule {
            id: id.to_string(),
            target_function: fname.to_string(),
            triggers: vec![nimbus_proto::messages::BEGIN_SOURCE.to_string()],
            locations,
            arguments,
            dag,
            client_id: "client".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_report_sends_status_and_statistics() {
        let (mut executor, sender) = pinned("incr").await;

        executor.handle_schedule(lonely_schedule("incr", "r1"));
        executor.handle_trigger(DagTrigger {
            id: "r1".to_string(),
            source: nimbus_proto::messages::BEGIN_SOURCE.to_string(),
            target_function: "incr".to_string(),
            ..Default::default()
        });
        executor.fire("incr", "r1").await.unwrap();
        sender.clear();

        assert_eq!(executor.report().await.unwrap(), LoopAction::Continue);

        let statuses: Vec<ThreadStatus> =
            sender.decoded_to(&ports::status_address(SCHED_IP));
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].running);
        assert!(statuses[0].functions.contains(&"incr".to_string()));

        let mgmt_statuses: Vec<ThreadStatus> =
            sender.decoded_to(&ports::utilization_report_address(MGMT_IP));
        assert_eq!(mgmt_statuses.len(), 1);

        let stats: Vec<ExecutorStatistics> =
            sender.decoded_to(&ports::statistics_report_address(MGMT_IP));
        assert_eq!(stats.len(), 1);
        let incr = &stats[0].statistics[0];
        assert_eq!(incr.fname, "incr");
        assert_eq!(incr.call_count, 1);
        assert!(incr.runtime.is_some());
    }

    #[tokio::test]
    async fn test_purge_drops_unpinned_drained_functions() {
        let (mut executor, _sender) = pinned("incr").await;

        executor.queue.insert("incr".to_string(), HashMap::new());
        executor.handle_unpin("incr");
        // Unpin with an empty queue already discards; simulate the departed
        // case where the queue entry lingers.
        executor.queue.insert("stale".to_string(), HashMap::new());
        executor.pinned.insert("stale".to_string(), Vec::new());

        executor.purge_stale();
        assert!(!executor.queue.contains_key("stale"));
        assert!(!executor.pinned.contains_key("stale"));
    }

    #[tokio::test]
    async fn test_depart_drains_then_notifies_manager() {
        let (mut executor, sender) = pinned("incr").await;

        // An in-flight schedule holds the departure open.
        executor.handle_schedule(lonely_schedule("incr", "r2"));
        executor.handle_self_depart();
        assert!(!executor.status.running);

        sender.clear();
        assert_eq!(executor.report().await.unwrap(), LoopAction::Continue);
        assert!(sender
            .decoded_to::<String>(&ports::depart_done_address(MGMT_IP))
            .is_empty());

        // Drain the pending firing, then the next report exits.
        executor.handle_trigger(DagTrigger {
            id: "r2".to_string(),
            source: nimbus_proto::messages::BEGIN_SOURCE.to_string(),
            target_function: "incr".to_string(),
            ..Default::default()
        });
        executor.fire("incr", "r2").await.unwrap();

        sender.clear();
        assert_eq!(executor.report().await.unwrap(), LoopAction::Exit);
        let done: Vec<String> = sender.decoded_to(&ports::depart_done_address(MGMT_IP));
        assert_eq!(done, vec!["10.0.0.1".to_string()]);
    }

    #[tokio::test]
    async fn test_depart_rejects_new_schedules() {
        let (mut executor, _sender) = pinned("incr").await;
        executor.handle_self_depart();

        let (resp, _) = executor.handle_schedule(lonely_schedule("incr", "r3"));
        assert!(!resp.success);
        assert_eq!(resp.error, ResponseError::InvalidTarget);
    }
}
