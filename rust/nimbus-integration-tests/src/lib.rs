//! In-process cluster harness
//!
//! Wires scheduler, executor, and manager cores together over a recording
//! sender: every pushed frame is routed to the component that owns the
//! destination port, so whole DAG invocations run without sockets and the
//! tests observe exactly the messages the real wire would carry.

use nimbus_config::IsolationMode;
use nimbus_executor::{Executor, ExecutorConfig, InvokeError, NativeInvoker, UserLibrary};
use nimbus_fabric::testing::RecordingSender;
use nimbus_kvs::MemoryKvs;
use nimbus_manager::{Manager, ManagerConfig, MockOrchestrator};
use nimbus_proto::args::{decode_literal, literal, Argument};
use nimbus_proto::messages::{
    Dag, DagCall, DagSchedule, DagTrigger, FunctionCall, GenericResponse, PinRequest,
    StatusType, ThreadStatus, UnpinRequest, Value,
};
use nimbus_proto::{from_bytes, ports};
use nimbus_scheduler::{Scheduler, SchedulerConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;

pub const SCHED_IP: &str = "10.1.0.1";
pub const MGMT_IP: &str = "10.1.0.100";

/// One scheduler replica, any number of executor threads, and an optional
/// manager, sharing a KVS and a recording sender
pub struct Cluster {
    pub scheduler: Scheduler,
    pub executors: HashMap<(String, u32), Executor>,
    pub manager: Option<Manager>,
    pub orchestrator: Arc<MockOrchestrator>,
    pub sender: Arc<RecordingSender>,
    pub kvs: Arc<MemoryKvs>,
    invoker: Arc<NativeInvoker>,
}

impl Cluster {
    pub fn new() -> Self {
        let kvs = Arc::new(MemoryKvs::new());
        let sender = Arc::new(RecordingSender::new());
        let orchestrator = Arc::new(MockOrchestrator::new());

        let scheduler = Scheduler::with_rng(
            SchedulerConfig {
                ip: SCHED_IP.to_string(),
                mgmt_ip: MGMT_IP.to_string(),
                route_addr: "10.1.0.200:6350".to_string(),
            },
            kvs.clone(),
            sender.clone(),
            StdRng::seed_from_u64(17),
        );

        Cluster {
            scheduler,
            executors: HashMap::new(),
            manager: None,
            orchestrator,
            sender,
            kvs,
            invoker: Arc::new(demo_invoker()),
        }
    }

    /// Attach a cluster manager core
    pub fn with_manager(mut self) -> Self {
        self.manager = Some(Manager::with_rng(
            ManagerConfig {
                ip: MGMT_IP.to_string(),
            },
            self.orchestrator.clone(),
            self.sender.clone(),
            StdRng::seed_from_u64(23),
        ));
        self
    }

    /// Spin up one executor thread
    pub fn add_executor(&mut self, ip: &str, tid: u32) {
        let config = ExecutorConfig {
            ip: ip.to_string(),
            tid,
            mgmt_ip: MGMT_IP.to_string(),
            schedulers: vec![SCHED_IP.to_string()],
            isolation: IsolationMode::Normal,
        };
        let library =
            UserLibrary::with_parts(ip, tid, self.kvs.clone(), self.sender.clone());
        let executor = Executor::new(
            config,
            self.kvs.clone(),
            self.invoker.clone(),
            self.sender.clone(),
            library,
        );
        // The startup status announcement every thread makes.
        self.scheduler.handle_thread_status(executor.status.clone());
        self.executors.insert((ip.to_string(), tid), executor);
    }

    /// Register a demo function body under `name`
    pub async fn register(&self, name: &str) {
        self.scheduler
            .registry
            .create_function(name, NativeInvoker::body_for(name))
            .await
            .expect("registry write");
    }

    /// Pin `name` on every executor thread and sync the scheduler's view
    pub async fn pin_everywhere(&mut self, name: &str) {
        let keys: Vec<(String, u32)> = self.executors.keys().cloned().collect();
        for (ip, tid) in keys {
            self.pin(name, &ip, tid).await;
        }
    }

    /// Pin `name` on one thread and sync the scheduler's view
    pub async fn pin(&mut self, name: &str, ip: &str, tid: u32) {
        let executor = self
            .executors
            .get_mut(&(ip.to_string(), tid))
            .expect("unknown executor");
        executor
            .handle_pin(PinRequest {
                name: name.to_string(),
                response_address: SCHED_IP.to_string(),
            })
            .await;
        executor.push_status(StatusType::PostRequest);
        self.pump().await;
    }

    /// Register a DAG through the scheduler's create path
    pub async fn create_dag(&mut self, dag: Dag) -> GenericResponse {
        // The pin handshake is exercised in the scheduler's unit tests;
        // here the accepts are pre-fed because every executor accepts.
        let replication = self.executors.len().min(15).max(1);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for _ in 0..(dag.functions.len() * replication) {
            tx.send(nimbus_proto::to_bytes(&GenericResponse::ok()).expect("encode"))
                .expect("preload accept");
        }

        let response = self.scheduler.create_dag(dag, &mut rx).await;
        self.pump().await;
        response
    }

    /// Invoke a DAG and drive the mesh until it quiesces
    pub async fn call_dag(&mut self, call: DagCall) -> GenericResponse {
        let response = self.scheduler.call_dag(call);
        self.pump().await;
        response
    }

    /// Invoke a standalone function and drive the mesh until it quiesces
    pub async fn call(&mut self, name: &str, args: Vec<Value>) -> GenericResponse {
        let response = self.scheduler.call_function(FunctionCall {
            name: name.to_string(),
            request_id: "req".to_string(),
            resp_id: None,
            args,
        });
        self.pump().await;
        response
    }

    /// Route recorded frames to their owners until nothing new is produced
    pub async fn pump(&mut self) {
        loop {
            let frames = self.sender.frames();
            self.sender.clear();
            if frames.is_empty() {
                return;
            }
            for (addr, frame) in frames {
                self.dispatch(&addr, frame).await;
            }
        }
    }

    async fn dispatch(&mut self, addr: &str, frame: Vec<u8>) {
        let Some((ip, port)) = addr.rsplit_once(':') else { return };
        let Ok(port) = port.parse::<u16>() else { return };
        let ip = ip.to_string();

        match port {
            p if (ports::PIN_PORT..ports::UNPIN_PORT).contains(&p) => {
                let tid = (p - ports::PIN_PORT) as u32;
                let Some(executor) = self.executors.get_mut(&(ip, tid)) else { return };
                if let Ok(req) = from_bytes::<PinRequest>(&frame) {
                    executor.handle_pin(req).await;
                    executor.push_status(StatusType::PostRequest);
                }
            }
            p if (ports::UNPIN_PORT..ports::FUNC_EXEC_PORT).contains(&p) => {
                let tid = (p - ports::UNPIN_PORT) as u32;
                let Some(executor) = self.executors.get_mut(&(ip, tid)) else { return };
                if let Ok(req) = from_bytes::<UnpinRequest>(&frame) {
                    executor.handle_unpin(&req.name);
                    executor.push_status(StatusType::PostRequest);
                }
            }
            p if (ports::FUNC_EXEC_PORT..ports::DAG_QUEUE_PORT).contains(&p) => {
                let tid = (p - ports::FUNC_EXEC_PORT) as u32;
                let Some(executor) = self.executors.get_mut(&(ip, tid)) else { return };
                if let Ok(call) = from_bytes::<FunctionCall>(&frame) {
                    let (_resp, prepared) = executor.handle_exec_single(call).await;
                    if let Some(prepared) = prepared {
                        executor.run_single(prepared).await.expect("single exec");
                    }
                }
            }
            p if (ports::DAG_QUEUE_PORT..ports::DAG_EXEC_PORT).contains(&p) => {
                let tid = (p - ports::DAG_QUEUE_PORT) as u32;
                let Some(executor) = self.executors.get_mut(&(ip, tid)) else { return };
                if let Ok(schedule) = from_bytes::<DagSchedule>(&frame) {
                    let fname = schedule.target_function.clone();
                    let id = schedule.id.clone();
                    let (_resp, ready) = executor.handle_schedule(schedule);
                    if ready {
                        executor.fire(&fname, &id).await.expect("fire");
                    }
                }
            }
            p if (ports::DAG_EXEC_PORT..ports::SELF_DEPART_PORT).contains(&p) => {
                let tid = (p - ports::DAG_EXEC_PORT) as u32;
                let Some(executor) = self.executors.get_mut(&(ip, tid)) else { return };
                if let Ok(trigger) = from_bytes::<DagTrigger>(&frame) {
                    let fname = trigger.target_function.clone();
                    let id = trigger.id.clone();
                    if executor.handle_trigger(trigger) {
                        executor.fire(&fname, &id).await.expect("fire");
                    }
                }
            }
            p if (ports::SELF_DEPART_PORT..ports::SELF_DEPART_PORT + 10).contains(&p) => {
                let tid = (p - ports::SELF_DEPART_PORT) as u32;
                if let Some(executor) = self.executors.get_mut(&(ip, tid)) {
                    executor.handle_self_depart();
                }
            }
            ports::STATUS_PORT => {
                if let Ok(status) = from_bytes::<ThreadStatus>(&frame) {
                    self.scheduler.handle_thread_status(status);
                }
            }
            ports::BACKOFF_PORT => {
                if let Ok(signal) = from_bytes(&frame) {
                    self.scheduler.handle_backoff(signal);
                }
            }
            ports::UTILIZATION_REPORT_PORT => {
                if let (Some(manager), Ok(status)) =
                    (self.manager.as_mut(), from_bytes::<ThreadStatus>(&frame))
                {
                    manager.handle_utilization(status);
                }
            }
            ports::EXECUTOR_DEPART_PORT => {
                if let (Some(manager), Ok(ip)) =
                    (self.manager.as_mut(), from_bytes::<String>(&frame))
                {
                    manager.handle_depart_done(ip).await;
                }
            }
            ports::STATISTICS_REPORT_PORT => {
                if let (Some(manager), Ok(stats)) =
                    (self.manager.as_mut(), from_bytes(&frame))
                {
                    manager.handle_statistics(stats);
                }
            }
            // Pin accepts, gossip to absent peers, and user pushes fall
            // through; nothing in the harness owns them.
            _ => {}
        }
    }

    /// How many times `(ip, tid)` has fired `name` since its last report
    pub fn exec_count(&self, ip: &str, tid: u32, name: &str) -> u64 {
        self.executors
            .get(&(ip.to_string(), tid))
            .and_then(|e| e.exec_counts.get(name).copied())
            .unwrap_or(0)
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

/// The functions the scenario suite runs: small integer arithmetic
pub fn demo_invoker() -> NativeInvoker {
    let mut invoker = NativeInvoker::new();

    invoker.register("incr", |_lib, args| async move {
        int_result(int_arg(&args, 0)? + 1)
    });
    invoker.register("square", |_lib, args| async move {
        let x = int_arg(&args, 0)?;
        int_result(x * x)
    });
    invoker.register("prep", |_lib, args| async move {
        int_result(int_arg(&args, 0)?)
    });
    invoker.register("m1", |_lib, args| async move {
        int_result(int_arg(&args, 0)? + 1)
    });
    invoker.register("m2", |_lib, args| async move {
        int_result(int_arg(&args, 0)? + 2)
    });
    invoker.register("m3", |_lib, args| async move {
        int_result(int_arg(&args, 0)? + 3)
    });
    invoker.register("avg", |_lib, args| async move {
        let sum = int_arg(&args, 0)? + int_arg(&args, 1)? + int_arg(&args, 2)?;
        int_result(sum / 3)
    });
    invoker.register("fail", |_lib, _args| async move {
        Err::<Vec<Value>, _>(InvokeError::User("deliberate failure".to_string()))
    });

    invoker
}

/// Decode argument `i` as an i64
pub fn int_arg(args: &[Argument], i: usize) -> Result<i64, InvokeError> {
    let arg = args
        .get(i)
        .ok_or_else(|| InvokeError::User(format!("missing argument {i}")))?;
    decode_literal::<i64>(arg)
        .map_err(|e| InvokeError::User(e.to_string()))?
        .ok_or_else(|| InvokeError::User("unresolved reference".to_string()))
}

/// Wrap an i64 as a single-value result
pub fn int_result(x: i64) -> Result<Vec<Value>, InvokeError> {
    Ok(vec![
        literal(&x).map_err(|e| InvokeError::User(e.to_string()))?
    ])
}

/// Decode the i64 stored at `key`
pub async fn stored_int(kvs: &MemoryKvs, key: &str) -> Option<i64> {
    let pair = kvs.peek(key)?;
    let values = nimbus_proto::args::decode_result(&pair.value).ok()?;
    let arg = nimbus_proto::args::decode_arg(values.first()?).ok()?;
    decode_literal::<i64>(&arg).ok()?
}
