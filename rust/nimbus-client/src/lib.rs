//! Nimbus client
//!
//! The thin client surface over the wire protocol: register functions and
//! DAGs, invoke them, and poll the KVS for results through futures. The
//! KVS address cache and its invalidation live inside the remote KVS client.

use nimbus_fabric::KVS_TIMEOUT;
use nimbus_kvs::{get_one_with_retry, KvsClient, RemoteKvsClient};
use nimbus_proto::args::{decode_arg, decode_literal, decode_result};
use nimbus_proto::messages::{
    Dag, DagCall, Function, FunctionCall, FunctionList, GenericResponse, ResponseError, Value,
};
use nimbus_proto::ports;
use nimbus_proto::{from_bytes, to_bytes};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced to client callers
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Fabric(#[from] nimbus_fabric::FabricError),

    #[error(transparent)]
    Proto(#[from] nimbus_proto::ProtoError),

    #[error(transparent)]
    Kvs(#[from] nimbus_kvs::KvsError),

    /// The scheduler rejected the request
    #[error("request rejected: {0:?}")]
    Rejected(ResponseError),

    /// A result payload was not in the expected shape
    #[error("unexpected result shape for {0}")]
    BadResult(String),
}

/// A connection to one scheduler replica
pub struct NimbusConnection {
    scheduler_ip: String,
    kvs: Arc<dyn KvsClient>,
}

impl NimbusConnection {
    /// Connect to `scheduler_ip`: look up the routing layer and build the
    /// KVS client for result polling
    pub async fn connect(scheduler_ip: impl Into<String>, my_ip: impl Into<String>) -> ClientResult<Self> {
        let scheduler_ip = scheduler_ip.into();

        let addr = ports::connect_address(&scheduler_ip, ports::CONNECT_PORT);
        let reply = nimbus_fabric::request(&addr, &to_bytes(&String::new())?, KVS_TIMEOUT).await?;
        let route_addr: String = from_bytes(&reply)?;

        Ok(NimbusConnection {
            scheduler_ip,
            kvs: Arc::new(RemoteKvsClient::new(route_addr, my_ip.into())),
        })
    }

    /// Connection over a caller-supplied KVS; used by tests and co-located
    /// tooling
    pub fn with_kvs(scheduler_ip: impl Into<String>, kvs: Arc<dyn KvsClient>) -> Self {
        NimbusConnection {
            scheduler_ip: scheduler_ip.into(),
            kvs,
        }
    }

    /// Register a function body under `name`
    pub async fn register(&self, name: &str, body: Vec<u8>) -> ClientResult<()> {
        let func = Function {
            name: name.to_string(),
            body,
        };
        let addr = ports::connect_address(&self.scheduler_ip, ports::FUNC_CREATE_PORT);
        let reply = nimbus_fabric::request(&addr, &to_bytes(&func)?, KVS_TIMEOUT).await?;
        expect_ok(&reply).map(|_| ())
    }

    /// List registered function names matching `prefix`
    pub async fn list(&self, prefix: &str) -> ClientResult<Vec<String>> {
        let addr = ports::connect_address(&self.scheduler_ip, ports::LIST_PORT);
        let reply =
            nimbus_fabric::request(&addr, &to_bytes(&prefix.to_string())?, KVS_TIMEOUT).await?;
        let list: FunctionList = from_bytes(&reply)?;
        Ok(list.names)
    }

    /// A callable handle for `name`, if it is registered
    pub async fn get_function(&self, name: &str) -> ClientResult<Option<NimbusFunction>> {
        let names = self.list(name).await?;
        if !names.iter().any(|n| n == name) {
            return Ok(None);
        }
        Ok(Some(NimbusFunction {
            name: name.to_string(),
            scheduler_ip: self.scheduler_ip.clone(),
            kvs: self.kvs.clone(),
        }))
    }

    /// Invoke a standalone function; returns the future of its result
    pub async fn call(&self, name: &str, args: Vec<Value>) -> ClientResult<NimbusFuture> {
        let call = FunctionCall {
            name: name.to_string(),
            request_id: Uuid::new_v4().to_string(),
            resp_id: None,
            args,
        };

        let addr = ports::connect_address(&self.scheduler_ip, ports::FUNC_CALL_PORT);
        let reply = nimbus_fabric::request(&addr, &to_bytes(&call)?, KVS_TIMEOUT).await?;
        let response = expect_ok(&reply)?;

        let obj_id = response
            .response_id
            .ok_or_else(|| ClientError::BadResult(name.to_string()))?;
        Ok(NimbusFuture {
            obj_id,
            kvs: self.kvs.clone(),
        })
    }

    /// Register a DAG definition
    pub async fn create_dag(&self, dag: &Dag) -> ClientResult<()> {
        let addr = ports::connect_address(&self.scheduler_ip, ports::DAG_CREATE_PORT);
        let reply = nimbus_fabric::request(&addr, &to_bytes(dag)?, KVS_TIMEOUT).await?;
        expect_ok(&reply).map(|_| ())
    }

    /// Invoke a DAG; returns the future of the key the output will land at
    pub async fn call_dag(&self, mut call: DagCall) -> ClientResult<NimbusFuture> {
        if call.client_id.is_empty() {
            call.client_id = Uuid::new_v4().to_string();
        }

        let addr = ports::connect_address(&self.scheduler_ip, ports::DAG_CALL_PORT);
        let reply = nimbus_fabric::request(&addr, &to_bytes(&call)?, KVS_TIMEOUT).await?;
        let response = expect_ok(&reply)?;

        let obj_id = match call.output_key {
            Some(key) => key,
            None => response
                .response_id
                .ok_or_else(|| ClientError::BadResult(call.name.clone()))?,
        };
        Ok(NimbusFuture {
            obj_id,
            kvs: self.kvs.clone(),
        })
    }
}

/// Sugar for repeated invocations of one registered function
pub struct NimbusFunction {
    pub name: String,
    scheduler_ip: String,
    kvs: Arc<dyn KvsClient>,
}

impl NimbusFunction {
    /// Invoke with the given wire arguments
    pub async fn call(&self, args: Vec<Value>) -> ClientResult<NimbusFuture> {
        let conn = NimbusConnection {
            scheduler_ip: self.scheduler_ip.clone(),
            kvs: self.kvs.clone(),
        };
        conn.call(&self.name, args).await
    }
}

/// Handle to a result that will appear in the KVS
pub struct NimbusFuture {
    pub obj_id: String,
    kvs: Arc<dyn KvsClient>,
}

impl NimbusFuture {
    /// Poll the KVS (bounded retry) and decode a scalar result
    pub async fn get<T: DeserializeOwned>(&self) -> ClientResult<T> {
        let values = self.get_raw().await?;
        let first = values
            .first()
            .ok_or_else(|| ClientError::BadResult(self.obj_id.clone()))?;
        let arg = decode_arg(first)?;
        decode_literal::<T>(&arg)?
            .ok_or_else(|| ClientError::BadResult(self.obj_id.clone()))
    }

    /// Poll the KVS and return the raw result values (a tuple result has
    /// more than one)
    pub async fn get_raw(&self) -> ClientResult<Vec<Value>> {
        let pair = get_one_with_retry(self.kvs.as_ref(), &self.obj_id).await?;
        Ok(decode_result(&pair.value)?)
    }
}

fn expect_ok(reply: &[u8]) -> ClientResult<GenericResponse> {
    let response: GenericResponse = from_bytes(reply)?;
    if !response.success {
        return Err(ClientError::Rejected(response.error));
    }
    Ok(response)
}
