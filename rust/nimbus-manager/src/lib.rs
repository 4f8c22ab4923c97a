//! Nimbus cluster manager
//!
//! Drives worker membership and elasticity: ingests thread statuses and
//! function statistics, scales the executor pool on utilization and
//! pinned-count signals, replicates hot functions, retires underutilized
//! nodes gracefully, and prunes departed storage nodes from the hash ring.

pub mod orchestrator;
pub mod policy;
pub mod ring;
pub mod server;

pub use orchestrator::{MockOrchestrator, Orchestrator};
pub use server::{Manager, ManagerConfig, ManagerServer};

use thiserror::Error;

/// Result type for manager operations
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors raised inside the cluster manager
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Proto(#[from] nimbus_proto::ProtoError),

    #[error(transparent)]
    Fabric(#[from] nimbus_fabric::FabricError),
}
