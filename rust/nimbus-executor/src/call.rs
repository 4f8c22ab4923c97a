//! Function execution
//!
//! Single-function calls, DAG firings in normal and causal mode, reference
//! resolution, sink persistence, and downstream trigger propagation.

use crate::server::Executor;
use crate::{ExecutorError, ExecutorResult, Invoker as _};
use nimbus_fabric::Sender as _;
use nimbus_kvs::{get_with_retry, KvsClient, LwwPair};
use nimbus_proto::args::{
    decode_arg, decode_args, error_tuple, encode_result, Argument,
};
use nimbus_proto::messages::{
    CausalLevel, ConsistencyMode, DagSchedule, DagTrigger, FunctionCall, GcNotice,
    GenericResponse, PayloadType, ResponseError, Value, VectorClock, VersionedKey,
};
use nimbus_proto::ports::{cache_gc_address, dag_trigger_address};
use nimbus_proto::to_bytes;
use std::collections::HashMap;
use tokio::time::Instant;
use uuid::Uuid;

/// A validated single-function call, ready to run after the reply is sent
pub struct PreparedSingle {
    pub name: String,
    pub body: Vec<u8>,
    pub resp_id: String,
    pub args: Vec<Value>,
}

impl Executor {
    /// Validate a standalone call; the response goes back before execution
    pub async fn handle_exec_single(
        &mut self,
        call: FunctionCall,
    ) -> (GenericResponse, Option<PreparedSingle>) {
        tracing::info!(function = %call.name, "received call");

        if !self.status.running {
            return (GenericResponse::err(ResponseError::InvalidTarget), None);
        }

        let resp_id = call
            .resp_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        match self.registry.try_retrieve_function(&call.name).await {
            Ok(Some(body)) => (
                GenericResponse::ok_with_id(resp_id.clone()),
                Some(PreparedSingle {
                    name: call.name,
                    body,
                    resp_id,
                    args: call.args,
                }),
            ),
            Ok(None) => (GenericResponse::err(ResponseError::FuncNotFound), None),
            Err(err) => {
                tracing::warn!(function = %call.name, "body lookup failed: {err}");
                (GenericResponse::err(ResponseError::FuncNotFound), None)
            }
        }
    }

    /// Run a prepared standalone call and persist its result
    pub async fn run_single(&mut self, prepared: PreparedSingle) -> ExecutorResult<()> {
        let start = Instant::now();

        let decoded = decode_args(&prepared.args)?;
        let resolved = self.resolve_refs_normal(decoded).await?;
        let result = self.invoke_or_error(&prepared.body, resolved).await?;

        let payload = encode_result(&result)?;
        self.kvs
            .put(
                &prepared.resp_id,
                LwwPair::now(self.config.tid, payload),
            )
            .await?;

        let elapsed = start.elapsed().as_secs_f64();
        *self.runtimes.entry(prepared.name.clone()).or_insert(0.0) += elapsed;
        *self.exec_counts.entry(prepared.name).or_insert(0) += 1;
        Ok(())
    }

    /// Fire one DAG function with its accumulated triggers
    pub(crate) async fn execute_dag_function(
        &mut self,
        schedule: DagSchedule,
        triggers: Vec<DagTrigger>,
    ) -> ExecutorResult<()> {
        match schedule.consistency {
            ConsistencyMode::Normal => self.fire_normal(schedule, triggers).await,
            ConsistencyMode::Causal => self.fire_causal(schedule, triggers).await,
        }
    }

    async fn fire_normal(
        &mut self,
        schedule: DagSchedule,
        triggers: Vec<DagTrigger>,
    ) -> ExecutorResult<()> {
        let fname = schedule.target_function.clone();
        tracing::info!(dag = %schedule.dag.name, function = %fname, id = %schedule.id,
            "executing function");

        let body = self
            .pinned
            .get(&fname)
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownSchedule(schedule.id.clone()))?;

        let decoded = decode_args(&self.collect_args(&schedule, &triggers))?;
        let resolved = self.resolve_refs_normal(decoded).await?;
        let result = self.invoke_or_error(&body, resolved).await?;

        if schedule.dag.is_sink(&fname) {
            tracing::info!(dag = %schedule.dag.name, id = %schedule.id, "dag completed");
            self.sink_output(&schedule, &result).await?;
        } else {
            self.forward_triggers(&schedule, &fname, &result, HashMap::new(), Vec::new())?;
        }

        Ok(())
    }

    async fn fire_causal(
        &mut self,
        schedule: DagSchedule,
        triggers: Vec<DagTrigger>,
    ) -> ExecutorResult<()> {
        let fname = schedule.target_function.clone();
        tracing::info!(dag = %schedule.dag.name, function = %fname, id = %schedule.id,
            "executing function in causal mode");

        let body = self
            .pinned
            .get(&fname)
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownSchedule(schedule.id.clone()))?;

        // Union the versioned-key locations and merge the dependency clocks
        // carried by every upstream trigger.
        let mut versioned_locations: HashMap<String, Vec<VersionedKey>> = HashMap::new();
        let mut dependencies: HashMap<String, VectorClock> = HashMap::new();
        for trigger in &triggers {
            for (addr, versions) in &trigger.versioned_key_locations {
                versioned_locations.insert(addr.clone(), versions.clone());
            }
            for dep in &trigger.dependencies {
                dependencies
                    .entry(dep.key.clone())
                    .and_modify(|clock| clock.merge(&dep.vector_clock))
                    .or_insert_with(|| dep.vector_clock.clone());
            }
        }

        let decoded = decode_args(&self.collect_args(&schedule, &triggers))?;
        let (resolved, read_clocks) = self
            .resolve_refs_causal(decoded, &schedule, &mut versioned_locations)
            .await?;
        for (key, clock) in read_clocks {
            dependencies
                .entry(key)
                .and_modify(|existing| existing.merge(&clock))
                .or_insert(clock);
        }

        let result = self.invoke_or_error(&body, resolved).await?;

        if schedule.dag.is_sink(&fname) {
            let out_key = schedule
                .output_key
                .clone()
                .unwrap_or_else(|| schedule.id.clone());

            let vector_clock = match dependencies.remove(&out_key) {
                Some(mut clock) => {
                    clock.bump(&schedule.client_id);
                    clock
                }
                None => VectorClock::singleton(schedule.client_id.clone()),
            };

            let dep_list: Vec<VersionedKey> = dependencies
                .into_iter()
                .map(|(key, vector_clock)| VersionedKey { key, vector_clock })
                .collect();

            let payload = encode_result(&result)?;
            self.causal_put_bounded(&out_key, vector_clock, dep_list, payload, &schedule.client_id)
                .await?;
            tracing::info!(dag = %schedule.dag.name, id = %schedule.id,
                "dag completed in causal mode");

            // Let every contributing cache release its pinned versions.
            for (cache_addr, versions) in &versioned_locations {
                let notice = GcNotice {
                    client_id: schedule.client_id.clone(),
                    keys: versions.iter().map(|v| v.key.clone()).collect(),
                };
                match cache_gc_address(cache_addr) {
                    Ok(addr) => self.sender.send(&addr, to_bytes(&notice)?),
                    Err(err) => tracing::debug!("skipping gc notice for {cache_addr}: {err}"),
                }
            }
        } else {
            let dep_list: Vec<VersionedKey> = dependencies
                .into_iter()
                .map(|(key, vector_clock)| VersionedKey { key, vector_clock })
                .collect();
            self.forward_triggers(&schedule, &fname, &result, versioned_locations, dep_list)?;
        }

        Ok(())
    }

    /// Literal args from the schedule, then trigger args in arrival order
    fn collect_args(&self, schedule: &DagSchedule, triggers: &[DagTrigger]) -> Vec<Value> {
        let mut args = schedule
            .arguments
            .get(&schedule.target_function)
            .cloned()
            .unwrap_or_default();
        for trigger in triggers {
            args.extend(trigger.arguments.iter().cloned());
        }
        args
    }

    /// Resolve references with a batched, bounded-retry get
    async fn resolve_refs_normal(
        &mut self,
        args: Vec<Argument>,
    ) -> ExecutorResult<Vec<Argument>> {
        let keys: Vec<String> = args
            .iter()
            .filter_map(|a| a.reference_key().map(str::to_string))
            .collect();
        if keys.is_empty() {
            return Ok(args);
        }

        let pairs = get_with_retry(self.kvs.as_ref(), &keys).await?;
        for key in &keys {
            self.cached_keys.insert(key.clone());
        }

        let mut resolved = Vec::with_capacity(args.len());
        for arg in args {
            let replacement = match &arg {
                Argument::Reference { key, .. } => pairs.get(key).map(|pair| Argument::Literal {
                    body: pair.value.clone(),
                    kind: PayloadType::Default,
                }),
                Argument::Literal { .. } => None,
            };
            resolved.push(replacement.unwrap_or(arg));
        }
        Ok(resolved)
    }

    /// Resolve references with a single causal snapshot read; returns the
    /// clocks of everything read for dependency tracking
    async fn resolve_refs_causal(
        &mut self,
        args: Vec<Argument>,
        schedule: &DagSchedule,
        versioned_locations: &mut HashMap<String, Vec<VersionedKey>>,
    ) -> ExecutorResult<(Vec<Argument>, HashMap<String, VectorClock>)> {
        let keys: Vec<String> = args
            .iter()
            .filter_map(|a| a.reference_key().map(str::to_string))
            .collect();
        if keys.is_empty() {
            return Ok((args, HashMap::new()));
        }

        let future_read_set = self.downstream_read_set(schedule)?;
        let result = self
            .kvs
            .causal_get(
                &keys,
                &future_read_set,
                CausalLevel::Cross,
                &schedule.client_id,
            )
            .await?;

        if let Some((addr, versions)) = result.cache {
            versioned_locations.insert(addr, versions);
        }

        for key in &keys {
            if !result.pairs.contains_key(key) {
                return Err(ExecutorError::Kvs(nimbus_kvs::KvsError::Unavailable(
                    format!("causal read missed key {key}"),
                )));
            }
            self.cached_keys.insert(key.clone());
        }

        let mut resolved = Vec::with_capacity(args.len());
        for arg in args {
            let replacement = match &arg {
                Argument::Reference { key, .. } => {
                    result.pairs.get(key).map(|(_, value)| Argument::Literal {
                        body: value.clone(),
                        kind: PayloadType::Default,
                    })
                }
                Argument::Literal { .. } => None,
            };
            resolved.push(replacement.unwrap_or(arg));
        }

        let clocks = result
            .pairs
            .into_iter()
            .map(|(key, (clock, _))| (key, clock))
            .collect();
        Ok((resolved, clocks))
    }

    /// Reference keys every downstream function will read; lets the causal
    /// layer pin versions the rest of the DAG depends on
    fn downstream_read_set(&self, schedule: &DagSchedule) -> ExecutorResult<Vec<String>> {
        let mut read_set = Vec::new();
        for child in schedule.dag.descendants(&schedule.target_function) {
            let Some(child_args) = schedule.arguments.get(&child) else {
                continue;
            };
            for value in child_args {
                if let Argument::Reference { key, .. } = decode_arg(value)? {
                    if !read_set.contains(&key) {
                        read_set.push(key);
                    }
                }
            }
        }
        Ok(read_set)
    }

    /// Invoke user code; a raised error becomes the in-band error tuple so
    /// downstream behavior is unchanged and the DAG does not stall
    async fn invoke_or_error(
        &self,
        body: &[u8],
        args: Vec<Argument>,
    ) -> ExecutorResult<Vec<Value>> {
        match self
            .invoker
            .invoke(body, self.user_library.clone(), args)
            .await
        {
            Ok(result) => Ok(result),
            Err(err) => {
                tracing::warn!("user function raised: {err}");
                let msg = err.to_string();
                Ok(error_tuple(&msg, msg.clone().into_bytes())?)
            }
        }
    }

    /// Persist a sink result to exactly one destination: the output key if
    /// set, else a push to the response address, else the schedule id
    async fn sink_output(
        &mut self,
        schedule: &DagSchedule,
        result: &[Value],
    ) -> ExecutorResult<()> {
        let payload = encode_result(result)?;

        if let Some(key) = &schedule.output_key {
            self.kvs
                .put(key, LwwPair::now(self.config.tid, payload))
                .await?;
        } else if let Some(addr) = &schedule.response_address {
            self.sender.send(addr, payload);
        } else {
            self.kvs
                .put(&schedule.id, LwwPair::now(self.config.tid, payload))
                .await?;
        }
        Ok(())
    }

    /// Build and push one trigger per outgoing edge
    fn forward_triggers(
        &self,
        schedule: &DagSchedule,
        fname: &str,
        result: &[Value],
        versioned_locations: HashMap<String, Vec<VersionedKey>>,
        dependencies: Vec<VersionedKey>,
    ) -> ExecutorResult<()> {
        for sink in schedule.dag.successors(fname) {
            let trigger = DagTrigger {
                id: schedule.id.clone(),
                source: fname.to_string(),
                target_function: sink.clone(),
                arguments: result.to_vec(),
                versioned_key_locations: versioned_locations.clone(),
                dependencies: dependencies.clone(),
            };

            let Some(location) = schedule.locations.get(&sink) else {
                tracing::warn!(function = %sink, "schedule carries no location; dropping trigger");
                continue;
            };
            let addr = dag_trigger_address(location)?;
            self.sender.send(&addr, to_bytes(&trigger)?);
        }
        Ok(())
    }

    /// Causal put retried on store-requested retries, bounded like every
    /// other KVS loop
    async fn causal_put_bounded(
        &self,
        key: &str,
        vector_clock: VectorClock,
        deps: Vec<VersionedKey>,
        payload: Vec<u8>,
        client_id: &str,
    ) -> ExecutorResult<()> {
        let deadline = Instant::now() + nimbus_kvs::RETRY_CUMULATIVE_CAP;

        loop {
            let accepted = self
                .kvs
                .causal_put(
                    key,
                    vector_clock.clone(),
                    deps.clone(),
                    payload.clone(),
                    client_id,
                )
                .await?;
            if accepted {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ExecutorError::Kvs(nimbus_kvs::KvsError::Unavailable(
                    format!("causal put of {key} kept being refused"),
                )));
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}
