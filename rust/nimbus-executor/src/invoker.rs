//! Function invocation capability
//!
//! User functions are stored as opaque body blobs; the executor is
//! constructed with an [`Invoker`] that knows how to turn a blob into a
//! callable. The native invoker interprets a body as the name of a
//! registered Rust closure and backs tests and local clusters.

use crate::user_library::UserLibrary;
use async_trait::async_trait;
use futures::future::BoxFuture;
use nimbus_proto::args::Argument;
use nimbus_proto::messages::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Ways an invocation can fail
#[derive(Error, Debug)]
pub enum InvokeError {
    /// The body blob does not name a callable this invoker knows
    #[error("unknown function body: {0}")]
    UnknownFunction(String),

    /// User code raised; the message flows downstream in-band
    #[error("{0}")]
    User(String),
}

/// Turns an opaque function body into an invocation
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Run the function with the user-library handle and decoded arguments;
    /// returns the result values (more than one means a tuple result)
    async fn invoke(
        &self,
        body: &[u8],
        library: Arc<UserLibrary>,
        args: Vec<Argument>,
    ) -> Result<Vec<Value>, InvokeError>;
}

type NativeFn = Arc<
    dyn Fn(Arc<UserLibrary>, Vec<Argument>) -> BoxFuture<'static, Result<Vec<Value>, InvokeError>>
        + Send
        + Sync,
>;

/// Invoker over a name-keyed table of async Rust closures
#[derive(Default)]
pub struct NativeInvoker {
    funcs: HashMap<String, NativeFn>,
}

impl NativeInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure under `name`; a body blob equal to the UTF-8 name
    /// dispatches to it
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(Arc<UserLibrary>, Vec<Argument>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Value>, InvokeError>> + Send + 'static,
    {
        self.funcs
            .insert(name.into(), Arc::new(move |lib, args| Box::pin(func(lib, args))));
    }

    /// The body blob that dispatches to `name`
    pub fn body_for(name: &str) -> Vec<u8> {
        name.as_bytes().to_vec()
    }
}

#[async_trait]
impl Invoker for NativeInvoker {
    async fn invoke(
        &self,
        body: &[u8],
        library: Arc<UserLibrary>,
        args: Vec<Argument>,
    ) -> Result<Vec<Value>, InvokeError> {
        let name = String::from_utf8_lossy(body).to_string();
        let func = self
            .funcs
            .get(&name)
            .ok_or_else(|| InvokeError::UnknownFunction(name.clone()))?;
        func(library, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_proto::args::{decode_literal, literal};

    #[tokio::test]
    async fn test_native_invoker_dispatches_by_body() {
        let mut invoker = NativeInvoker::new();
        invoker.register("incr", |_lib, args| async move {
            let x: i64 = decode_literal(&args[0])
                .ok()
                .flatten()
                .ok_or_else(|| InvokeError::User("expected an integer".to_string()))?;
            Ok(vec![literal(&(x + 1)).map_err(|e| InvokeError::User(e.to_string()))?])
        });

        let library = UserLibrary::detached();
        let args = vec![nimbus_proto::args::decode_arg(&literal(&41i64).unwrap()).unwrap()];
        let result = invoker
            .invoke(&NativeInvoker::body_for("incr"), library, args)
            .await
            .unwrap();

        let out = nimbus_proto::args::decode_arg(&result[0]).unwrap();
        assert_eq!(decode_literal::<i64>(&out).unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_unknown_body_is_an_error() {
        let invoker = NativeInvoker::new();
        let library = UserLibrary::detached();
        let err = invoker
            .invoke(b"ghost", library, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::UnknownFunction(_)));
    }
}
