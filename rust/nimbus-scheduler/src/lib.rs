//! Nimbus scheduler
//!
//! Translates function and DAG invocations into concrete placements and
//! fan-outs: accepts create/call requests, chooses workers by data locality,
//! pushes schedules and triggers, ingests executor thread statuses, and
//! gossips its view to peer schedulers every few seconds.

pub mod call;
pub mod create;
pub mod gossip;
pub mod placement;
pub mod server;

#[cfg(test)]
pub(crate) mod test_util;

pub use server::{Scheduler, SchedulerConfig, SchedulerServer};

use thiserror::Error;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors raised inside the scheduler
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Kvs(#[from] nimbus_kvs::KvsError),

    #[error(transparent)]
    Registry(#[from] nimbus_registry::RegistryError),

    #[error(transparent)]
    Proto(#[from] nimbus_proto::ProtoError),

    #[error(transparent)]
    Fabric(#[from] nimbus_fabric::FabricError),
}
