//! Shared fixtures for scheduler unit tests

use crate::server::{Scheduler, SchedulerConfig};
use nimbus_fabric::testing::RecordingSender;
use nimbus_kvs::MemoryKvs;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

/// Deterministic scheduler over a recording sender and in-memory KVS
pub(crate) fn scheduler_with_seed(seed: u64) -> Scheduler {
    let (scheduler, _, _) = scheduler_parts(seed);
    scheduler
}

/// Same, exposing the sender and KVS for assertions
pub(crate) fn scheduler_parts(seed: u64) -> (Scheduler, Arc<RecordingSender>, Arc<MemoryKvs>) {
    let kvs = Arc::new(MemoryKvs::new());
    let sender = Arc::new(RecordingSender::new());
    let config = SchedulerConfig {
        ip: "10.0.1.1".to_string(),
        mgmt_ip: "10.0.1.100".to_string(),
        route_addr: "10.0.1.200:6350".to_string(),
    };
    let scheduler = Scheduler::with_rng(
        config,
        kvs.clone(),
        sender.clone(),
        StdRng::seed_from_u64(seed),
    );
    (scheduler, sender, kvs)
}

/// Register a live executor thread, optionally pinned with functions
pub(crate) fn add_executor(scheduler: &mut Scheduler, ip: &str, tid: u32, functions: &[&str]) {
    let key = (ip.to_string(), tid);
    scheduler.executors.insert(key.clone());
    for fname in functions {
        scheduler
            .func_locations
            .entry(fname.to_string())
            .or_default()
            .insert(key.clone());
    }
}
