//! Autoscaling policy
//!
//! Three levers, evaluated every report round: pool-level scale-out and
//! scale-in on mean utilization and pinned counts, per-function replication
//! on throughput and latency drift, and per-thread overload replication.

use crate::orchestrator::Orchestrator;
use crate::server::{Manager, ThreadKey};
use nimbus_fabric::Sender as _;
use nimbus_proto::messages::PinRequest;
use nimbus_proto::ports::{pin_address, self_depart_address};
use nimbus_proto::to_bytes;
use rand::seq::{IteratorRandom, SliceRandom};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// Mean utilization above which the pool grows
pub const UTILIZATION_MAX: f64 = 0.30;

/// Mean pinned-function count above which the pool grows
pub const PINNED_COUNT_MAX: f64 = 15.0;

/// Mean utilization below which the pool may shrink
pub const UTILIZATION_MIN: f64 = 0.10;

/// Latency growth over the historical mean that triggers replication
pub const LATENCY_RATIO: f64 = 1.25;

/// Cooldown after a scale-out during which no scale decisions are made
pub const GRACE_PERIOD: Duration = Duration::from_secs(180);

/// Seconds covered by one executor statistics report
pub const EXECUTOR_REPORT_PERIOD: f64 = 20.0;

/// Executor threads per node; a departure drains all of them
pub const NUM_EXEC_THREADS: u32 = 3;

/// Nodes added per scale-out
pub const EXECUTOR_INCREASE: usize = 2;

/// The pool never shrinks below this many live threads
pub const SCALE_IN_THREAD_FLOOR: usize = 15;

/// Per-thread utilization past which its functions are replicated
pub const OVERLOAD_UTILIZATION: f64 = 0.9;

impl Manager {
    /// Pool-level elasticity on mean utilization and pinned counts
    pub async fn check_executor_utilization(&mut self) {
        if self.executor_statuses.is_empty() {
            return;
        }

        let thread_count = self.executor_statuses.len();
        let mut utilization_sum = 0.0;
        let mut pinned_count = 0usize;
        for status in self.executor_statuses.values() {
            utilization_sum += status.utilization;
            pinned_count += status.functions.len();
        }
        let avg_utilization = utilization_sum / thread_count as f64;
        let avg_pinned = pinned_count as f64 / thread_count as f64;
        tracing::info!(avg_utilization, avg_pinned, "executor pool state");

        // No decisions while a scale-out grace period is open.
        if let Some(start) = self.grace_start {
            if start.elapsed() < GRACE_PERIOD {
                return;
            }
            self.grace_start = None;
        }

        if avg_utilization > UTILIZATION_MAX || avg_pinned > PINNED_COUNT_MAX {
            tracing::info!(
                avg_utilization,
                nodes = EXECUTOR_INCREASE,
                "scaling out the executor pool"
            );
            self.orchestrator
                .add_nodes("function", EXECUTOR_INCREASE)
                .await;
            self.grace_start = Some(Instant::now());
            return;
        }

        if avg_utilization < UTILIZATION_MIN && thread_count > SCALE_IN_THREAD_FLOOR {
            let Some(victim_ip) = self
                .executor_statuses
                .keys()
                .map(|(ip, _)| ip.clone())
                .collect::<HashSet<_>>()
                .into_iter()
                .choose(&mut self.rng)
            else {
                return;
            };
            tracing::info!(avg_utilization, ip = %victim_ip, "retiring underutilized node");

            for tid in 0..NUM_EXEC_THREADS {
                self.sender
                    .send(&self_depart_address(&victim_ip, tid), Vec::new());
                self.executor_statuses.remove(&(victim_ip.clone(), tid));
            }
            self.departing.insert(victim_ip, NUM_EXEC_THREADS);
        }
    }

    /// Per-function replication on throughput pressure and latency drift,
    /// plus per-thread overload replication
    pub async fn check_function_load(&mut self) {
        let mut func_locations = self.func_locations();
        let executors: HashSet<ThreadKey> = self.executor_statuses.keys().cloned().collect();

        let frequencies: Vec<(String, u64)> = self
            .function_frequencies
            .iter()
            .map(|(f, c)| (f.clone(), *c))
            .collect();

        for (fname, call_count) in frequencies {
            let (total_runtime, runtime_count) =
                self.function_runtimes.get(&fname).copied().unwrap_or((0.0, 0));
            if call_count == 0 || total_runtime == 0.0 || runtime_count == 0 {
                continue;
            }

            let mut avg_latency = total_runtime / runtime_count as f64;
            let replicas = func_locations.get(&fname).map(Vec::len).unwrap_or(0).max(1);
            let throughput = replicas as f64 * EXECUTOR_REPORT_PERIOD / avg_latency;
            tracing::info!(function = %fname, call_count, avg_latency, throughput, replicas,
                "function load");

            let mut blended_count = runtime_count;
            if call_count as f64 > throughput * 0.8 {
                let needed =
                    (call_count as f64 / throughput).ceil() as i64 - replicas as i64 + 1;
                tracing::info!(function = %fname, needed, "call count exceeds throughput");
                self.replicate_function(&fname, needed, &mut func_locations, &executors)
                    .await;
            } else if let Some((historical, history_count)) =
                self.latency_history.get(&fname).copied()
            {
                let ratio = avg_latency / historical;
                if ratio > LATENCY_RATIO {
                    let needed = ratio.ceil() as i64 - replicas as i64 + 1;
                    tracing::info!(function = %fname, ratio, needed,
                        "latency drifted past the historical mean");
                    self.replicate_function(&fname, needed, &mut func_locations, &executors)
                        .await;
                }

                // Blend this round into the history.
                let total = total_runtime + historical * history_count as f64;
                blended_count = runtime_count + history_count;
                avg_latency = total / blended_count as f64;
            }

            self.latency_history
                .insert(fname.clone(), (avg_latency, blended_count));
        }

        // Overloaded threads get every pinned function replicated once.
        let overloaded: Vec<(ThreadKey, Vec<String>)> = self
            .executor_statuses
            .iter()
            .filter(|(_, status)| status.utilization > OVERLOAD_UTILIZATION)
            .map(|(key, status)| (key.clone(), status.functions.clone()))
            .collect();
        for (key, functions) in overloaded {
            tracing::info!(ip = %key.0, tid = key.1, "thread over 90% utilization");
            for fname in functions {
                self.replicate_function(&fname, 1, &mut func_locations, &executors)
                    .await;
            }
        }
    }

    /// Pin `count` more replicas of `fname` on threads that lack it
    pub async fn replicate_function(
        &mut self,
        fname: &str,
        count: i64,
        func_locations: &mut HashMap<String, Vec<ThreadKey>>,
        executors: &HashSet<ThreadKey>,
    ) {
        if count <= 0 {
            return;
        }

        for _ in 0..count {
            let existing: HashSet<ThreadKey> = func_locations
                .get(fname)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default();
            let mut candidates: Vec<ThreadKey> =
                executors.difference(&existing).cloned().collect();
            if candidates.is_empty() {
                continue;
            }
            candidates.sort();
            candidates.shuffle(&mut self.rng);
            let (ip, tid) = candidates[0].clone();

            let request = PinRequest {
                name: fname.to_string(),
                response_address: self.config.ip.clone(),
            };
            if let Ok(bytes) = to_bytes(&request) {
                self.sender.send(&pin_address(&ip, tid), bytes);
            }
            func_locations
                .entry(fname.to_string())
                .or_default()
                .push((ip, tid));
        }
    }

    /// Create pods on provisioned-but-idle nodes
    pub async fn check_unused_nodes(&mut self) {
        for kind in ["ebs", "memory"] {
            let node_ips: HashSet<String> =
                self.orchestrator.node_ips(kind).await.into_iter().collect();
            let pod_ips: HashSet<String> =
                self.orchestrator.pod_ips(kind).await.into_iter().collect();

            let unallocated = node_ips.difference(&pod_ips).count();
            tracing::info!(kind, unallocated, "unallocated nodes");
            if unallocated > 0 {
                self.orchestrator.add_nodes(kind, unallocated).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::MockOrchestrator;
    use crate::server::{Manager, ManagerConfig};
    use nimbus_fabric::testing::RecordingSender;
    use nimbus_proto::messages::{ExecutorStatistics, FunctionStatistics, ThreadStatus};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn manager() -> (Manager, Arc<MockOrchestrator>, Arc<RecordingSender>) {
        let orchestrator = Arc::new(MockOrchestrator::new());
        let sender = Arc::new(RecordingSender::new());
        let core = Manager::with_rng(
            ManagerConfig {
                ip: "10.0.2.1".to_string(),
            },
            orchestrator.clone(),
            sender.clone(),
            StdRng::seed_from_u64(42),
        );
        (core, orchestrator, sender)
    }

    fn thread_status(ip: &str, tid: u32, utilization: f64, functions: &[&str]) -> ThreadStatus {
        ThreadStatus {
            ip: ip.to_string(),
            tid,
            running: true,
            utilization,
            functions: functions.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        }
    }

    fn fill_pool(core: &mut Manager, nodes: usize, utilization: f64, functions: &[&str]) {
        for n in 0..nodes {
            for tid in 0..NUM_EXEC_THREADS {
                let ip = format!("10.0.3.{n}");
                core.handle_utilization(thread_status(&ip, tid, utilization, functions));
            }
        }
    }

    #[tokio::test]
    async fn test_scale_out_on_high_utilization_then_grace() {
        let (mut core, orchestrator, _sender) = manager();
        fill_pool(&mut core, 2, 0.5, &[]);

        core.check_executor_utilization().await;
        assert_eq!(
            orchestrator.added.lock().as_slice(),
            &[("function".to_string(), EXECUTOR_INCREASE)]
        );
        assert!(core.grace_start.is_some());

        // Still hot, but the grace period gates further scale-outs.
        core.check_executor_utilization().await;
        assert_eq!(orchestrator.added.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_scale_out_on_pinned_count() {
        let (mut core, orchestrator, _sender) = manager();
        let many: Vec<String> = (0..20).map(|i| format!("f{i}")).collect();
        let names: Vec<&str> = many.iter().map(String::as_str).collect();
        fill_pool(&mut core, 1, 0.01, &names);

        core.check_executor_utilization().await;
        assert_eq!(orchestrator.added.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_graceful_scale_in_retires_one_node() {
        let (mut core, orchestrator, sender) = manager();
        // 7 nodes x 3 threads = 21 threads at 5% utilization.
        fill_pool(&mut core, 7, 0.05, &["f"]);

        core.check_executor_utilization().await;

        // Exactly one IP's three threads were told to depart.
        let addresses = sender.addresses();
        assert_eq!(addresses.len(), 3);
        let ip = addresses[0].split(':').next().unwrap().to_string();
        for tid in 0..NUM_EXEC_THREADS {
            assert!(addresses.contains(&format!("{ip}:{}", 4050 + tid)));
        }

        // Its statuses are gone and further reports from it are ignored.
        assert_eq!(core.executor_statuses.len(), 18);
        assert_eq!(core.departing[&ip], NUM_EXEC_THREADS);
        core.handle_utilization(thread_status(&ip, 0, 0.5, &[]));
        assert_eq!(core.executor_statuses.len(), 18);

        // The orchestrator removal waits for every depart-done.
        core.handle_depart_done(ip.clone()).await;
        core.handle_depart_done(ip.clone()).await;
        assert!(orchestrator.removed.lock().is_empty());
        core.handle_depart_done(ip.clone()).await;
        assert_eq!(
            orchestrator.removed.lock().as_slice(),
            &[("function".to_string(), ip)]
        );
    }

    #[tokio::test]
    async fn test_no_scale_in_below_thread_floor() {
        let (mut core, _orchestrator, sender) = manager();
        // 4 nodes x 3 threads = 12 threads, below the floor of 15.
        fill_pool(&mut core, 4, 0.01, &[]);

        core.check_executor_utilization().await;
        assert!(sender.frames().is_empty());
        assert!(core.departing.is_empty());
    }

    #[tokio::test]
    async fn test_throughput_pressure_adds_replicas() {
        let (mut core, _orchestrator, sender) = manager();
        fill_pool(&mut core, 2, 0.2, &[]);
        // One replica of f on one thread.
        core.handle_utilization(thread_status("10.0.3.0", 0, 0.2, &["f"]));

        // 1 replica x 20s / 0.5s latency = 40 calls of capacity; 100 calls
        // demand ceil(100/40) - 1 + 1 = 3 more replicas.
        core.handle_statistics(ExecutorStatistics {
            statistics: vec![FunctionStatistics {
                fname: "f".to_string(),
                call_count: 100,
                runtime: None,
            }],
        });
        core.handle_statistics(ExecutorStatistics {
            statistics: vec![FunctionStatistics {
                fname: "f".to_string(),
                call_count: 10,
                runtime: Some(5.0),
            }],
        });

        core.check_function_load().await;

        let pins = sender
            .frames()
            .iter()
            .filter(|(addr, _)| addr.contains(":40"))
            .count();
        assert_eq!(pins, 3);
    }

    #[tokio::test]
    async fn test_latency_drift_adds_replicas() {
        let (mut core, _orchestrator, sender) = manager();
        fill_pool(&mut core, 2, 0.2, &[]);
        core.handle_utilization(thread_status("10.0.3.0", 0, 0.2, &["f"]));

        // Historical mean latency 0.5s; this round doubles it.
        core.latency_history.insert("f".to_string(), (0.5, 10));
        core.handle_statistics(ExecutorStatistics {
            statistics: vec![FunctionStatistics {
                fname: "f".to_string(),
                call_count: 2,
                runtime: None,
            }],
        });
        core.handle_statistics(ExecutorStatistics {
            statistics: vec![FunctionStatistics {
                fname: "f".to_string(),
                call_count: 4,
                runtime: Some(4.0),
            }],
        });

        core.check_function_load().await;

        // ratio 2.0 -> ceil(2) - 1 replica + 1 = 2 new pins.
        let pins = sender
            .frames()
            .iter()
            .filter(|(addr, _)| addr.contains(":40"))
            .count();
        assert_eq!(pins, 2);

        // History blends toward the new latency.
        let (blended, count) = core.latency_history["f"];
        assert_eq!(count, 14);
        assert!(blended > 0.5 && blended < 1.0);
    }

    #[tokio::test]
    async fn test_overloaded_thread_replicates_its_functions() {
        let (mut core, _orchestrator, sender) = manager();
        fill_pool(&mut core, 2, 0.2, &[]);
        core.handle_utilization(thread_status("10.0.3.0", 0, 0.95, &["f", "g"]));

        core.check_function_load().await;

        let pins: Vec<PinRequest> = sender
            .frames()
            .iter()
            .filter_map(|(_, frame)| nimbus_proto::from_bytes(frame).ok())
            .collect();
        let mut names: Vec<&str> = pins.iter().map(|p| p.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["f", "g"]);
    }

    #[tokio::test]
    async fn test_unused_nodes_get_pods() {
        let (mut core, orchestrator, _sender) = manager();
        orchestrator.set_nodes("memory", &["10.0.4.1", "10.0.4.2"]);
        orchestrator.set_pods("memory", &["10.0.4.1"]);

        core.check_unused_nodes().await;
        assert!(orchestrator
            .added
            .lock()
            .contains(&("memory".to_string(), 1)));
    }
}
