//! Shared fixtures for executor unit tests

use crate::server::{Executor, ExecutorConfig};
use crate::user_library::UserLibrary;
use crate::{InvokeError, Invoker, NativeInvoker};
use nimbus_config::IsolationMode;
use nimbus_fabric::testing::RecordingSender;
use nimbus_kvs::MemoryKvs;
use nimbus_proto::args::{decode_literal, literal, Argument};
use nimbus_proto::messages::Value;
use std::sync::Arc;

pub(crate) const TEST_IP: &str = "10.0.0.1";
pub(crate) const SCHED_IP: &str = "10.0.0.50";
pub(crate) const MGMT_IP: &str = "10.0.0.100";

/// Executor over a recording sender and in-memory KVS
pub(crate) fn executor_with(
    isolation: IsolationMode,
    invoker: Arc<dyn Invoker>,
) -> (Executor, Arc<RecordingSender>, Arc<MemoryKvs>) {
    executor_on(TEST_IP, 0, isolation, invoker)
}

/// Same, with explicit identity
pub(crate) fn executor_on(
    ip: &str,
    tid: u32,
    isolation: IsolationMode,
    invoker: Arc<dyn Invoker>,
) -> (Executor, Arc<RecordingSender>, Arc<MemoryKvs>) {
    let kvs = Arc::new(MemoryKvs::new());
    executor_on_kvs(ip, tid, isolation, invoker, kvs)
}

/// Same, over a caller-supplied KVS
pub(crate) fn executor_on_kvs(
    ip: &str,
    tid: u32,
    isolation: IsolationMode,
    invoker: Arc<dyn Invoker>,
    kvs: Arc<MemoryKvs>,
) -> (Executor, Arc<RecordingSender>, Arc<MemoryKvs>) {
    let sender = Arc::new(RecordingSender::new());
    let config = ExecutorConfig {
        ip: ip.to_string(),
        tid,
        mgmt_ip: MGMT_IP.to_string(),
        schedulers: vec![SCHED_IP.to_string()],
        isolation,
    };
    let library = UserLibrary::with_parts(ip, tid, kvs.clone(), sender.clone());
    let executor = Executor::new(config, kvs.clone(), invoker, sender.clone(), library);
    (executor, sender, kvs)
}

/// An invoker with the arithmetic functions the scenario tests use
pub(crate) fn arithmetic_invoker() -> NativeInvoker {
    let mut invoker = NativeInvoker::new();

    invoker.register("incr", |_lib, args| async move {
        let x = int_arg(&args, 0)?;
        int_result(x + 1)
    });
    invoker.register("square", |_lib, args| async move {
        let x = int_arg(&args, 0)?;
        int_result(x * x)
    });
    invoker.register("fail", |_lib, _args| async move {
        Err::<Vec<Value>, _>(InvokeError::User("deliberate failure".to_string()))
    });

    invoker
}

/// Decode argument `i` as an i64, whether literal or a resolved reference
pub(crate) fn int_arg(args: &[Argument], i: usize) -> Result<i64, InvokeError> {
    let arg = args
        .get(i)
        .ok_or_else(|| InvokeError::User(format!("missing argument {i}")))?;
    decode_literal::<i64>(arg)
        .map_err(|e| InvokeError::User(e.to_string()))?
        .ok_or_else(|| InvokeError::User("unresolved reference".to_string()))
}

pub(crate) fn int_result(x: i64) -> Result<Vec<Value>, InvokeError> {
    Ok(vec![
        literal(&x).map_err(|e| InvokeError::User(e.to_string()))?
    ])
}

/// Register a body for `name` so pins and single calls can find it
pub(crate) async fn seed_function(executor: &Executor, name: &str) {
    executor
        .registry
        .create_function(name, NativeInvoker::body_for(name))
        .await
        .unwrap();
}
