//! Function and DAG registration
//!
//! DAG creation pins every function to a random subset of executors with an
//! accept-first handshake: the pin request carries this scheduler's reply
//! address, the executor answers on the well-known pin-accept port, and a
//! missed 500 ms deadline moves on to another candidate.

use crate::server::{Scheduler, ThreadKey};
use nimbus_fabric::channels::recv_timeout;
use nimbus_fabric::Sender as _;
use nimbus_fabric::PIN_ACCEPT_TIMEOUT;
use nimbus_proto::messages::{
    Dag, Function, GenericResponse, PinRequest, ResponseError, UnpinRequest,
};
use nimbus_proto::ports::{pin_address, unpin_address};
use nimbus_proto::to_bytes;
use rand::seq::SliceRandom;
use tokio::sync::mpsc::UnboundedReceiver;

/// Pin replicas per function at DAG creation
pub const DEFAULT_PIN_REPLICATION: usize = 15;

impl Scheduler {
    /// Store a function body in the registry
    pub async fn create_function(&mut self, func: Function) -> GenericResponse {
        match self.registry.create_function(&func.name, func.body).await {
            Ok(()) => GenericResponse::ok(),
            Err(err) => {
                tracing::warn!(function = %func.name, "create failed: {err}");
                GenericResponse::err(ResponseError::FuncNotFound)
            }
        }
    }

    /// Validate, store, and pin a DAG
    pub async fn create_dag(
        &mut self,
        dag: Dag,
        pin_accept_rx: &mut UnboundedReceiver<Vec<u8>>,
    ) -> GenericResponse {
        tracing::info!(dag = %dag.name, "creating dag");

        if let Err(err) = dag.validate() {
            tracing::warn!(dag = %dag.name, "rejecting malformed dag: {err}");
            return GenericResponse::err(ResponseError::InvalidTarget);
        }

        for fname in &dag.functions {
            match self.registry.try_retrieve_function(fname).await {
                Ok(Some(_)) => {}
                _ => {
                    tracing::warn!(dag = %dag.name, function = %fname, "unknown function");
                    return GenericResponse::err(ResponseError::FuncNotFound);
                }
            }
        }

        if let Err(err) = self.registry.store_dag(&dag).await {
            tracing::warn!(dag = %dag.name, "dag store failed: {err}");
            return GenericResponse::err(ResponseError::InvalidTarget);
        }

        let replication = DEFAULT_PIN_REPLICATION.min(self.executors.len());
        let mut pinned_all: Vec<(String, ThreadKey)> = Vec::new();

        for fname in &dag.functions {
            let pinned = self.pin_function(fname, replication, pin_accept_rx).await;
            if pinned.is_empty() {
                tracing::warn!(dag = %dag.name, function = %fname, "no executor accepted the pin");
                // Roll back what this create already placed.
                for (fname, (ip, tid)) in &pinned_all {
                    if let Ok(bytes) = to_bytes(&UnpinRequest {
                        name: fname.clone(),
                    }) {
                        self.sender.send(&unpin_address(ip, *tid), bytes);
                    }
                }
                return GenericResponse::err(ResponseError::InvalidTarget);
            }

            for key in pinned {
                self.func_locations
                    .entry(fname.clone())
                    .or_default()
                    .insert(key.clone());
                pinned_all.push((fname.clone(), key));
            }
            self.call_frequency.entry(fname.clone()).or_insert(0);
        }

        let sources = dag.sources();
        self.dags.insert(dag.name.clone(), (dag, sources));
        GenericResponse::ok()
    }

    /// Accept-first pin of `fname` onto up to `replication` random threads
    async fn pin_function(
        &mut self,
        fname: &str,
        replication: usize,
        pin_accept_rx: &mut UnboundedReceiver<Vec<u8>>,
    ) -> Vec<ThreadKey> {
        let mut candidates: Vec<ThreadKey> = self.executors.iter().cloned().collect();
        candidates.sort();
        candidates.shuffle(&mut self.rng);

        let request = PinRequest {
            name: fname.to_string(),
            response_address: self.config.ip.clone(),
        };
        let Ok(request_bytes) = to_bytes(&request) else {
            return Vec::new();
        };

        let mut pinned = Vec::new();
        for key in candidates {
            if pinned.len() >= replication.max(1) {
                break;
            }

            let (ip, tid) = &key;
            self.sender.send(&pin_address(ip, *tid), request_bytes.clone());

            match recv_timeout(pin_accept_rx, PIN_ACCEPT_TIMEOUT).await {
                Ok(frame) => match nimbus_proto::from_bytes::<GenericResponse>(&frame) {
                    Ok(resp) if resp.success => pinned.push(key),
                    Ok(_) => {
                        tracing::debug!(function = fname, ?key, "pin rejected");
                    }
                    Err(err) => {
                        tracing::debug!("malformed pin accept: {err}");
                    }
                },
                Err(_) => {
                    tracing::debug!(function = fname, ?key, "pin accept timed out");
                }
            }
        }

        pinned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::scheduler_with_seed;
    use nimbus_proto::messages::DagConnection;

    fn chain_dag() -> Dag {
        Dag {
            name: "chain".to_string(),
            functions: vec!["incr".to_string(), "square".to_string()],
            connections: vec![DagConnection {
                source: "incr".to_string(),
                sink: "square".to_string(),
            }],
        }
    }

    async fn seed_functions(scheduler: &Scheduler, names: &[&str]) {
        for name in names {
            scheduler
                .registry
                .create_function(name, name.as_bytes().to_vec())
                .await
                .unwrap();
        }
    }

    fn accept_channel(
        accepts: usize,
    ) -> (
        UnboundedReceiver<Vec<u8>>,
        tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        for _ in 0..accepts {
            tx.send(to_bytes(&GenericResponse::ok()).unwrap()).unwrap();
        }
        (rx, tx)
    }

    #[tokio::test]
    async fn test_create_dag_pins_every_function() {
        let mut scheduler = scheduler_with_seed(1);
        scheduler.executors.insert(("10.0.0.1".to_string(), 0));
        scheduler.executors.insert(("10.0.0.2".to_string(), 0));
        seed_functions(&scheduler, &["incr", "square"]).await;

        let (mut rx, _tx) = accept_channel(4);
        let resp = scheduler.create_dag(chain_dag(), &mut rx).await;
        assert!(resp.success);

        assert!(scheduler.dags.contains_key("chain"));
        assert_eq!(scheduler.dags["chain"].1, vec!["incr".to_string()]);
        assert_eq!(scheduler.func_locations["incr"].len(), 2);
        assert_eq!(scheduler.func_locations["square"].len(), 2);
        assert_eq!(scheduler.call_frequency["incr"], 0);
    }

    #[tokio::test]
    async fn test_create_dag_rejects_cycle() {
        let mut scheduler = scheduler_with_seed(1);
        seed_functions(&scheduler, &["incr", "square"]).await;

        let mut dag = chain_dag();
        dag.connections.push(DagConnection {
            source: "square".to_string(),
            sink: "incr".to_string(),
        });

        let (mut rx, _tx) = accept_channel(0);
        let resp = scheduler.create_dag(dag, &mut rx).await;
        assert!(!resp.success);
        assert!(scheduler.dags.is_empty());
    }

    #[tokio::test]
    async fn test_create_dag_rejects_unregistered_function() {
        let mut scheduler = scheduler_with_seed(1);
        scheduler.executors.insert(("10.0.0.1".to_string(), 0));
        seed_functions(&scheduler, &["incr"]).await;

        let (mut rx, _tx) = accept_channel(0);
        let resp = scheduler.create_dag(chain_dag(), &mut rx).await;
        assert!(!resp.success);
        assert_eq!(resp.error, ResponseError::FuncNotFound);
    }

    #[tokio::test]
    async fn test_pin_timeout_moves_to_next_candidate() {
        let mut scheduler = scheduler_with_seed(2);
        scheduler.executors.insert(("10.0.0.1".to_string(), 0));
        scheduler.executors.insert(("10.0.0.2".to_string(), 0));

        // Only one accept arrives; the other candidate times out.
        let (mut rx, _tx) = accept_channel(1);
        let pinned = scheduler.pin_function("f", 2, &mut rx).await;
        assert_eq!(pinned.len(), 1);
    }
}
