//! Status ingestion and peer gossip
//!
//! Thread statuses keep the func-location index consistent with what
//! executors actually report; scheduler statuses spread DAG names and pin
//! observations between replicas so any replica can serve any call after one
//! gossip round.

use crate::server::{Scheduler, ThreadKey};
use nimbus_fabric::{Sender as _, KVS_TIMEOUT};
use nimbus_kvs::KvsClient;
use nimbus_proto::messages::{
    Backoff, ExecutorStatistics, FunctionLocation, FunctionStatistics, KeySet, SchedulerStatus,
    StatusType, ThreadStatus,
};
use nimbus_proto::ports;
use nimbus_proto::{from_bytes, to_bytes};
use nimbus_registry::cache_index_key;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// Window within which duplicate periodic statuses are ignored
pub const STATUS_DEDUPE_WINDOW: Duration = Duration::from_secs(5);

impl Scheduler {
    /// Ingest one executor thread status
    pub fn handle_thread_status(&mut self, status: ThreadStatus) {
        let key: ThreadKey = status.key();
        tracing::info!(ip = %key.0, tid = key.1, "status update from executor");

        // Suppress duplicate periodic reports inside the dedupe window; a
        // post-request report always refreshes.
        if let Some(seen) = self.status_seen.get(&key) {
            match status.r#type {
                StatusType::Periodic => {
                    if seen.elapsed() < STATUS_DEDUPE_WINDOW {
                        return;
                    }
                    self.status_seen.remove(&key);
                }
                StatusType::PostRequest => {
                    self.status_seen.remove(&key);
                }
            }
        }

        if !status.running {
            // Departing thread: remove it from every index.
            if let Some(old) = self.thread_statuses.remove(&key) {
                for fname in &old.functions {
                    if let Some(locations) = self.func_locations.get_mut(fname) {
                        locations.remove(&key);
                    }
                }
            }
            self.executors.remove(&key);
            self.status_seen.remove(&key);
            return;
        }

        self.executors.insert(key.clone());

        // Diff against the previous pin list rather than trusting
        // accumulated state.
        if let Some(old) = self.thread_statuses.get(&key) {
            if old != &status {
                for fname in &old.functions {
                    if let Some(locations) = self.func_locations.get_mut(fname) {
                        locations.remove(&key);
                    }
                }
            }
        }

        for fname in &status.functions {
            self.func_locations
                .entry(fname.clone())
                .or_default()
                .insert(key.clone());
        }

        self.status_seen.insert(key.clone(), Instant::now());
        self.thread_statuses.insert(key, status);
    }

    /// Ingest one peer scheduler's gossip
    pub async fn handle_scheduler_status(&mut self, status: SchedulerStatus) {
        for dname in &status.dags {
            if self.dags.contains_key(dname) {
                continue;
            }

            // A peer knows this DAG, so its body is (or will be) in the KVS.
            match self.registry.load_dag(dname).await {
                Ok(dag) => {
                    for fname in &dag.functions {
                        self.call_frequency.entry(fname.clone()).or_insert(0);
                        self.func_locations.entry(fname.clone()).or_default();
                    }
                    let sources = dag.sources();
                    self.dags.insert(dag.name.clone(), (dag, sources));
                    tracing::info!(dag = %dname, "adopted dag from peer gossip");
                }
                Err(err) => {
                    tracing::warn!(dag = %dname, "gossiped dag not readable: {err}");
                }
            }
        }

        for floc in &status.func_locations {
            self.func_locations
                .entry(floc.name.clone())
                .or_default()
                .insert((floc.ip.clone(), floc.tid));
        }
    }

    /// Hold a thread out of placement for the backoff window
    pub fn handle_backoff(&mut self, signal: Backoff) {
        self.backoff
            .insert((signal.ip, signal.tid), Instant::now());
    }

    /// Broadcast this replica's DAG names and pin observations to peers
    pub fn emit_gossip(&mut self) {
        let mut status = SchedulerStatus {
            dags: self.dags.keys().cloned().collect(),
            func_locations: Vec::new(),
        };
        for (fname, locations) in &self.func_locations {
            for (ip, tid) in locations {
                status.func_locations.push(FunctionLocation {
                    name: fname.clone(),
                    ip: ip.clone(),
                    tid: *tid,
                });
            }
        }

        let Ok(bytes) = to_bytes(&status) else { return };
        for peer in &self.schedulers {
            if peer != &self.config.ip {
                self.sender
                    .send(&ports::scheduler_update_address(peer), bytes.clone());
            }
        }
    }

    /// Report per-function call frequencies to the cluster manager and reset
    pub fn report_statistics(&mut self) {
        let mut stats = ExecutorStatistics::default();
        for (fname, count) in self.call_frequency.iter_mut() {
            if *count > 0 {
                tracing::info!(function = %fname, calls = *count, "reporting call frequency");
            }
            stats.statistics.push(FunctionStatistics {
                fname: fname.clone(),
                call_count: *count,
                runtime: None,
            });
            *count = 0;
        }

        if stats.statistics.is_empty() {
            return;
        }
        if let Ok(bytes) = to_bytes(&stats) {
            self.sender.send(
                &ports::statistics_report_address(&self.config.mgmt_ip),
                bytes,
            );
        }
    }

    /// Refresh the key→IP locality map and the peer scheduler list
    pub async fn refresh_cluster_state(&mut self) {
        self.refresh_key_map().await;

        let addr = ports::scheduler_list_address(&self.config.mgmt_ip);
        match nimbus_fabric::request(&addr, &[], KVS_TIMEOUT).await {
            Ok(frame) => match from_bytes::<KeySet>(&frame) {
                Ok(list) => self.schedulers = list.keys,
                Err(err) => tracing::debug!("malformed scheduler list: {err}"),
            },
            Err(err) => {
                tracing::debug!("scheduler list unavailable: {err}");
            }
        }
    }

    /// Rebuild the key→IP map from the per-executor cache index keys
    pub async fn refresh_key_map(&mut self) {
        let ips: HashSet<String> = self.executors.iter().map(|(ip, _)| ip.clone()).collect();
        if ips.is_empty() {
            return;
        }

        let index_keys: Vec<String> = ips.iter().map(|ip| cache_index_key(ip)).collect();
        let Ok(found) = self.kvs.get(&index_keys).await else {
            return;
        };

        self.key_ip_map.clear();
        for ip in &ips {
            let Some(pair) = found.get(&cache_index_key(ip)) else {
                continue;
            };
            let Ok(keys) = bincode::deserialize::<Vec<String>>(&pair.value) else {
                tracing::debug!(ip = %ip, "unreadable cache index");
                continue;
            };
            for key in keys {
                let entry = self.key_ip_map.entry(key).or_default();
                if !entry.contains(ip) {
                    entry.push(ip.clone());
                }
            }
        }
    }
}
