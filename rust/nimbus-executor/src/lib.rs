//! Nimbus executor
//!
//! Hosts pinned functions on behalf of schedulers. Each physical worker runs
//! a fixed number of executor threads (default 3); each thread is an
//! independent logical executor with its own ports, driven by a single
//! cooperative polling loop over pin/unpin/exec/schedule/trigger/depart
//! events.

pub mod call;
pub mod invoker;
pub mod pin;
pub mod server;
pub mod user_library;

#[cfg(test)]
pub(crate) mod test_util;

pub use invoker::{InvokeError, Invoker, NativeInvoker};
pub use server::{Executor, ExecutorConfig, ExecutorServer, LoopAction};
pub use user_library::UserLibrary;

use thiserror::Error;

/// Number of executor threads per physical worker
pub const THREADS_PER_NODE: u32 = 3;

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Errors raised inside the executor runtime
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Kvs(#[from] nimbus_kvs::KvsError),

    #[error(transparent)]
    Registry(#[from] nimbus_registry::RegistryError),

    #[error(transparent)]
    Proto(#[from] nimbus_proto::ProtoError),

    #[error(transparent)]
    Fabric(#[from] nimbus_fabric::FabricError),

    /// A schedule or trigger referenced state this thread does not hold
    #[error("no in-flight state for schedule {0}")]
    UnknownSchedule(String),
}
