//! Invocation handling
//!
//! A function call is routed to one worker; a DAG call fans out one schedule
//! per function plus a BEGIN trigger per source. Both reply immediately with
//! the id the client should poll.

use crate::server::Scheduler;
use nimbus_fabric::Sender as _;
use nimbus_proto::args::decode_args;
use nimbus_proto::messages::{
    DagCall, DagSchedule, DagTrigger, FunctionCall, GenericResponse, ResponseError, Value,
    BEGIN_SOURCE,
};
use nimbus_proto::ports::{dag_trigger_address, exec_address, join_location};
use nimbus_proto::to_bytes;
use uuid::Uuid;

impl Scheduler {
    /// Route a standalone call to a worker chosen by locality
    pub fn call_function(&mut self, mut call: FunctionCall) -> GenericResponse {
        let refs = reference_keys(&call.args);

        let Some((ip, tid)) = self.pick_location(None, &refs) else {
            tracing::warn!(function = %call.name, "no executors available");
            return GenericResponse::err(ResponseError::InvalidTarget);
        };

        let resp_id = call
            .resp_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        call.resp_id = Some(resp_id.clone());

        match to_bytes(&call) {
            Ok(bytes) => self.sender.send(&exec_address(&ip, tid), bytes),
            Err(err) => {
                tracing::warn!(function = %call.name, "encode failed: {err}");
                return GenericResponse::err(ResponseError::InvalidTarget);
            }
        }

        GenericResponse::ok_with_id(resp_id)
    }

    /// Fan out one DAG invocation
    pub fn call_dag(&mut self, call: DagCall) -> GenericResponse {
        let Some((dag, sources)) = self.dags.get(&call.name).cloned() else {
            return GenericResponse::err(ResponseError::NoSuchDag);
        };

        // Pick a location for every function before touching the wire.
        let mut locations = std::collections::HashMap::new();
        for fname in &dag.functions {
            let refs = call
                .function_args
                .get(fname)
                .map(|args| reference_keys(args))
                .unwrap_or_default();

            let Some((ip, tid)) = self.pick_location(Some(fname), &refs) else {
                tracing::warn!(dag = %call.name, function = %fname, "no pinned executor");
                return GenericResponse::err(ResponseError::InvalidTarget);
            };
            locations.insert(fname.clone(), join_location(&ip, tid));
        }

        let schedule_id = Uuid::new_v4().to_string();
        let base = DagSchedule {
            id: schedule_id.clone(),
            dag: dag.clone(),
            arguments: call.function_args.clone(),
            locations: locations.clone(),
            consistency: call.consistency,
            output_key: call.output_key.clone(),
            response_address: call.response_address.clone(),
            client_id: call.client_id.clone(),
            ..Default::default()
        };

        for fname in &dag.functions {
            let predecessors = dag.predecessors(fname);
            let mut schedule = base.clone();
            schedule.target_function = fname.clone();
            schedule.triggers = if predecessors.is_empty() {
                vec![BEGIN_SOURCE.to_string()]
            } else {
                predecessors
            };

            let location = &locations[fname];
            let (ip, tid) = match nimbus_proto::ports::split_location(location) {
                Ok(parts) => parts,
                Err(err) => {
                    tracing::warn!("malformed location {location}: {err}");
                    return GenericResponse::err(ResponseError::InvalidTarget);
                }
            };

            match to_bytes(&schedule) {
                Ok(bytes) => self
                    .sender
                    .send(&nimbus_proto::ports::dag_queue_address(&ip, tid), bytes),
                Err(err) => {
                    tracing::warn!(dag = %call.name, "schedule encode failed: {err}");
                    return GenericResponse::err(ResponseError::InvalidTarget);
                }
            }

            *self.call_frequency.entry(fname.clone()).or_insert(0) += 1;
        }

        for source in &sources {
            let trigger = DagTrigger {
                id: schedule_id.clone(),
                source: BEGIN_SOURCE.to_string(),
                target_function: source.clone(),
                ..Default::default()
            };

            let addr = match dag_trigger_address(&locations[source]) {
                Ok(addr) => addr,
                Err(err) => {
                    tracing::warn!("malformed location for {source}: {err}");
                    continue;
                }
            };
            match to_bytes(&trigger) {
                Ok(bytes) => self.sender.send(&addr, bytes),
                Err(err) => tracing::warn!("trigger encode failed: {err}"),
            }
        }

        tracing::info!(dag = %call.name, id = %schedule_id, "dag call dispatched");
        GenericResponse::ok_with_id(schedule_id)
    }
}

/// Reference keys mentioned in an argument list
fn reference_keys(args: &[Value]) -> Vec<String> {
    decode_args(args)
        .map(|decoded| {
            decoded
                .iter()
                .filter_map(|a| a.reference_key().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{add_executor, scheduler_parts};
    use nimbus_proto::args::literal;
    use nimbus_proto::messages::{Dag, DagConnection};

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

    #[tokio::test]
    async fn test_call_function_pushes_with_resp_id() {
        let (mut scheduler, sender, _kvs) = scheduler_parts(1);
        add_executor(&mut scheduler, "10.0.0.1", 0, &[]);

        let call = FunctionCall {
            name: "incr".to_string(),
            request_id: "req".to_string(),
            args: vec![literal(&1i64).unwrap()],
            ..Default::default()
        };
        let resp = scheduler.call_function(call);
        assert!(resp.success);
        let resp_id = resp.response_id.unwrap();

        let pushed: Vec<FunctionCall> = sender.decoded_to("10.0.0.1:4020");
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].resp_id.as_deref(), Some(resp_id.as_str()));
    }

    #[tokio::test]
    async fn test_call_function_without_executors_fails() {
        let (mut scheduler, _sender, _kvs) = scheduler_parts(1);
        let resp = scheduler.call_function(FunctionCall::default());
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn test_unknown_dag_is_no_such_dag_without_state_change() {
        let (mut scheduler, sender, _kvs) = scheduler_parts(1);

        let resp = scheduler.call_dag(DagCall {
            name: "nope".to_string(),
            ..Default::default()
        });

        assert!(!resp.success);
        assert_eq!(resp.error, ResponseError::NoSuchDag);
        assert!(sender.frames().is_empty());
        assert!(scheduler.call_frequency.is_empty());
    }

    #[tokio::test]
    async fn test_call_dag_fans_out_schedules_and_begin_trigger() {
        let (mut scheduler, sender, _kvs) = scheduler_parts(1);
        add_executor(&mut scheduler, "10.0.0.1", 0, &["incr", "square"]);

        let dag = chain_dag();
        let sources = dag.sources();
        scheduler.dags.insert("chain".to_string(), (dag, sources));

        let mut call = DagCall {
            name: "chain".to_string(),
            client_id: "client".to_string(),
            ..Default::default()
        };
        call.function_args
            .insert("incr".to_string(), vec![literal(&3i64).unwrap()]);

        let resp = scheduler.call_dag(call);
        assert!(resp.success);
        let id = resp.response_id.unwrap();

        // One schedule per function lands on the worker's queue port.
        let schedules: Vec<DagSchedule> = sender.decoded_to("10.0.0.1:4030");
        assert_eq!(schedules.len(), 2);
        for schedule in &schedules {
            assert_eq!(schedule.id, id);
            assert_eq!(schedule.locations.len(), 2);
            if schedule.target_function == "incr" {
                assert_eq!(schedule.triggers, vec![BEGIN_SOURCE.to_string()]);
            } else {
                assert_eq!(schedule.triggers, vec!["incr".to_string()]);
            }
        }

        // The single source gets its BEGIN trigger.
        let triggers: Vec<DagTrigger> = sender.decoded_to("10.0.0.1:4040");
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].source, BEGIN_SOURCE);
        assert_eq!(triggers[0].target_function, "incr");

        // Every function's frequency ticks up.
        assert_eq!(scheduler.call_frequency["incr"], 1);
        assert_eq!(scheduler.call_frequency["square"], 1);
    }

    #[tokio::test]
    async fn test_call_dag_respects_schedule_locations_invariant() {
        let (mut scheduler, sender, _kvs) = scheduler_parts(2);
        add_executor(&mut scheduler, "10.0.0.1", 0, &["incr"]);
        add_executor(&mut scheduler, "10.0.0.2", 1, &["square"]);

        let dag = chain_dag();
        let sources = dag.sources();
        scheduler.dags.insert("chain".to_string(), (dag, sources));

        let resp = scheduler.call_dag(DagCall {
            name: "chain".to_string(),
            ..Default::default()
        });
        assert!(resp.success);

        // incr's schedule goes only to the thread pinned with incr, and the
        // locations map pins square to its own thread.
        let incr_schedules: Vec<DagSchedule> = sender.decoded_to("10.0.0.1:4030");
        assert_eq!(incr_schedules.len(), 1);
        assert_eq!(incr_schedules[0].target_function, "incr");
        assert_eq!(incr_schedules[0].locations["square"], "10.0.0.2:1");

        let square_schedules: Vec<DagSchedule> = sender.decoded_to("10.0.0.2:4031");
        assert_eq!(square_schedules.len(), 1);
        assert_eq!(square_schedules[0].target_function, "square");
    }
}
