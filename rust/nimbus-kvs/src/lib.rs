//! Nimbus KVS client interface
//!
//! The KVS itself is an external collaborator; this crate defines the
//! `Get/Put/CausalGet/CausalPut` interface the compute plane consumes, the
//! lattice and vector-clock types that cross it, an in-memory implementation
//! for tests and local clusters, and the bounded retry policy for
//! retry-until-present reads.

pub mod lattice;
pub mod memory;
pub mod remote;
pub mod retry;

pub use lattice::{generate_timestamp, LwwPair};
pub use memory::MemoryKvs;
pub use remote::RemoteKvsClient;
pub use retry::{get_one_with_retry, get_with_retry, RETRY_ATTEMPT_TIMEOUT, RETRY_CUMULATIVE_CAP};

use async_trait::async_trait;
use nimbus_proto::messages::{CausalLevel, VectorClock, VersionedKey};
use std::collections::HashMap;
use thiserror::Error;

/// Result type for KVS operations
pub type KvsResult<T> = Result<T, KvsError>;

/// Errors raised by KVS clients
#[derive(Error, Debug)]
pub enum KvsError {
    /// The store did not answer within the bounded retry window
    #[error("kvs unavailable: {0}")]
    Unavailable(String),

    /// Transport failure underneath a request
    #[error(transparent)]
    Fabric(#[from] nimbus_fabric::FabricError),

    /// Malformed payload in a response
    #[error(transparent)]
    Proto(#[from] nimbus_proto::ProtoError),

    /// The routing layer returned no address for a key
    #[error("no address for key {0}")]
    NoAddress(String),
}

/// Result of a causal read: the cache that pinned versions (if any) plus the
/// resolved `(vector_clock, value)` pairs
#[derive(Debug, Clone, Default)]
pub struct CausalGetResult {
    pub cache: Option<(String, Vec<VersionedKey>)>,
    pub pairs: HashMap<String, (VectorClock, Vec<u8>)>,
}

/// The KVS interface consumed by every Nimbus component
#[async_trait]
pub trait KvsClient: Send + Sync {
    /// Batched get; missing keys are absent from the returned map
    async fn get(&self, keys: &[String]) -> KvsResult<HashMap<String, LwwPair>>;

    /// Last-writer-wins put
    async fn put(&self, key: &str, value: LwwPair) -> KvsResult<()>;

    /// Causally-consistent batched get
    async fn causal_get(
        &self,
        keys: &[String],
        future_read_set: &[String],
        level: CausalLevel,
        client_id: &str,
    ) -> KvsResult<CausalGetResult>;

    /// Causally-consistent put; false means the store asked for a retry
    async fn causal_put(
        &self,
        key: &str,
        vector_clock: VectorClock,
        deps: Vec<VersionedKey>,
        value: Vec<u8>,
        client_id: &str,
    ) -> KvsResult<bool>;
}
