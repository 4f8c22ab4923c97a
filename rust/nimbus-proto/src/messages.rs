//! Control-plane message types
//!
//! Every record exchanged between clients, schedulers, executors, and the
//! cluster manager. Numeric discriminants are part of the wire contract and
//! must not be renumbered.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Error codes carried in [`GenericResponse`]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseError {
    /// The request succeeded
    Success = 0,
    /// Pin or schedule sent to the wrong or departing thread
    InvalidTarget = 1,
    /// No function registered under the requested name
    FuncNotFound = 2,
    /// No DAG registered under the requested name
    NoSuchDag = 3,
    /// The target thread does not have the function pinned
    NotPinned = 4,
    /// User code raised during execution
    ExecError = 5,
}

/// Serialization format tag for argument and result payloads
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PayloadType {
    /// Bincode-encoded native value
    #[default]
    Default = 0,
    /// Raw UTF-8 string payload
    String = 1,
    /// Opaque ndarray payload, carried without interpretation
    Numpy = 2,
}

/// Lattice type tags understood by the KVS
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LatticeType {
    /// Last-writer-wins pair
    #[default]
    Lww = 0,
    /// Unordered set lattice
    Set = 1,
    /// Single-key causal lattice
    SingleCausal = 2,
    /// Multi-key causal lattice
    MultiCausal = 3,
}

/// Consistency mode of a DAG invocation
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConsistencyMode {
    /// Eventual consistency; references resolved with blocking retry
    #[default]
    Normal = 0,
    /// Causal consistency; vector clocks threaded through triggers
    Causal = 1,
}

/// Read level of a causal KVS request
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CausalLevel {
    /// Per-key causal reads
    #[default]
    Single = 0,
    /// Cross-key causal snapshot reads
    Cross = 1,
}

/// Whether a thread status report is periodic or post-request
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum StatusType {
    /// Emitted on the ~20 s reporting interval
    #[default]
    Periodic = 0,
    /// Emitted immediately after a state-changing request
    PostRequest = 1,
}

/// KVS request kind
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum KeyRequestType {
    #[default]
    Get = 0,
    Put = 1,
}

/// Per-tuple KVS error codes: 0 ok, 1 missing, 2 wrong-thread
pub mod tuple_error {
    pub const OK: u8 = 0;
    pub const MISSING: u8 = 1;
    pub const WRONG_THREAD: u8 = 2;
}

/// A vector clock: client id to logical counter
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct VectorClock(pub BTreeMap<String, u64>);

impl VectorClock {
    /// Clock with a single `(client_id, 1)` entry
    pub fn singleton(client_id: impl Into<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(client_id.into(), 1);
        VectorClock(map)
    }

    /// Pairwise-max merge of two clocks
    pub fn merge(&mut self, other: &VectorClock) {
        for (cid, counter) in &other.0 {
            let entry = self.0.entry(cid.clone()).or_insert(0);
            *entry = (*entry).max(*counter);
        }
    }

    /// Increment the counter for `client_id`, inserting it at 1 if absent
    pub fn bump(&mut self, client_id: &str) {
        *self.0.entry(client_id.to_string()).or_insert(0) += 1;
    }
}

/// A key at a specific causal version
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VersionedKey {
    pub key: String,
    pub vector_clock: VectorClock,
}

/// One key's worth of a [`KeyRequest`] or [`KeyResponse`]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct KeyTuple {
    pub key: String,
    pub payload: Vec<u8>,
    pub lattice_type: LatticeType,
    pub timestamp: u64,
    pub address_cache_size: u32,
    /// Response only: 0 ok, 1 missing, 2 wrong-thread
    pub error: u8,
    /// Response only: the requester's address cache for this key is stale
    pub invalidate: bool,
    /// Response only: replacement addresses for the stale cache entry
    pub addresses: Vec<String>,
}

/// A batched get/put against the KVS
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct KeyRequest {
    pub request_id: String,
    pub r#type: KeyRequestType,
    pub response_address: String,
    pub tuples: Vec<KeyTuple>,
}

/// The KVS reply to a [`KeyRequest`]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct KeyResponse {
    pub request_id: String,
    pub r#type: KeyRequestType,
    pub tuples: Vec<KeyTuple>,
}

/// One key's worth of a causal request or response
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CausalTuple {
    pub key: String,
    pub payload: Vec<u8>,
    pub vector_clock: VectorClock,
    pub deps: Vec<VersionedKey>,
    pub error: u8,
}

/// A causally-consistent get/put against the KVS
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CausalRequest {
    pub request_id: String,
    pub r#type: KeyRequestType,
    pub response_address: String,
    pub consistency: CausalLevel,
    pub client_id: String,
    pub vector_clock: VectorClock,
    pub deps: Vec<VersionedKey>,
    pub versioned_key_locations: HashMap<String, Vec<VersionedKey>>,
    pub future_read_set: Vec<String>,
    pub tuples: Vec<CausalTuple>,
}

/// The KVS reply to a [`CausalRequest`]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CausalResponse {
    pub request_id: String,
    pub r#type: KeyRequestType,
    /// The cache that served the read and the versions it pinned
    pub versioned_key_locations: HashMap<String, Vec<VersionedKey>>,
    pub tuples: Vec<CausalTuple>,
}

/// An opaque argument or result payload with its format tag
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Value {
    pub body: Vec<u8>,
    pub r#type: PayloadType,
}

/// A registered function: unique name plus opaque body blob
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub body: Vec<u8>,
}

/// A directed edge between two DAG functions
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DagConnection {
    pub source: String,
    pub sink: String,
}

/// An acyclic composition of registered functions
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Dag {
    pub name: String,
    pub functions: Vec<String>,
    pub connections: Vec<DagConnection>,
}

/// Invocation of a single standalone function
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct FunctionCall {
    pub name: String,
    pub request_id: String,
    pub resp_id: Option<String>,
    pub args: Vec<Value>,
}

/// Invocation of a whole DAG
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DagCall {
    pub name: String,
    pub function_args: HashMap<String, Vec<Value>>,
    pub consistency: ConsistencyMode,
    pub output_key: Option<String>,
    pub response_address: Option<String>,
    pub client_id: String,
}

/// A concrete assignment of a DAG's functions to worker threads
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DagSchedule {
    pub id: String,
    pub dag: Dag,
    pub arguments: HashMap<String, Vec<Value>>,
    /// Function name to `ip:tid` location
    pub locations: HashMap<String, String>,
    /// The function this copy of the schedule is addressed to
    pub target_function: String,
    /// Trigger sources the target must collect before firing
    pub triggers: Vec<String>,
    pub consistency: ConsistencyMode,
    pub output_key: Option<String>,
    pub response_address: Option<String>,
    pub client_id: String,
}

/// The data-carrying signal for one DAG edge
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DagTrigger {
    pub id: String,
    pub source: String,
    pub target_function: String,
    pub arguments: Vec<Value>,
    pub versioned_key_locations: HashMap<String, Vec<VersionedKey>>,
    pub dependencies: Vec<VersionedKey>,
}

/// Synthetic trigger source delivered to DAG source functions
pub const BEGIN_SOURCE: &str = "BEGIN";

/// Self-reported state of one executor thread
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ThreadStatus {
    pub ip: String,
    pub tid: u32,
    pub running: bool,
    pub utilization: f64,
    pub functions: Vec<String>,
    pub r#type: StatusType,
}

impl ThreadStatus {
    /// The `(ip, tid)` pair identifying this thread
    pub fn key(&self) -> (String, u32) {
        (self.ip.clone(), self.tid)
    }
}

/// A `(function, ip, tid)` pin observation
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionLocation {
    pub name: String,
    pub ip: String,
    pub tid: u32,
}

/// Gossip payload exchanged between scheduler replicas
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SchedulerStatus {
    pub dags: Vec<String>,
    pub func_locations: Vec<FunctionLocation>,
}

/// Per-function call statistics reported to the cluster manager
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionStatistics {
    pub fname: String,
    pub call_count: u64,
    /// Cumulative runtime in seconds; absent for scheduler-side reports
    pub runtime: Option<f64>,
}

/// A batch of [`FunctionStatistics`]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ExecutorStatistics {
    pub statistics: Vec<FunctionStatistics>,
}

/// Generic success/error reply
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GenericResponse {
    pub success: bool,
    pub error: ResponseError,
    pub response_id: Option<String>,
}

impl GenericResponse {
    /// A successful reply with no response id
    pub fn ok() -> Self {
        GenericResponse {
            success: true,
            error: ResponseError::Success,
            response_id: None,
        }
    }

    /// A successful reply carrying a response id
    pub fn ok_with_id(id: impl Into<String>) -> Self {
        GenericResponse {
            success: true,
            error: ResponseError::Success,
            response_id: Some(id.into()),
        }
    }

    /// A failed reply with the given error code
    pub fn err(error: ResponseError) -> Self {
        GenericResponse {
            success: false,
            error,
            response_id: None,
        }
    }
}

/// Reply to a function-list query
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct FunctionList {
    pub names: Vec<String>,
}

/// A bare set of keys or addresses
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct KeySet {
    pub keys: Vec<String>,
}

/// Accept-first pin request pushed to an executor thread
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PinRequest {
    pub name: String,
    /// IP of the requester; the accept lands on its pin-accept port
    pub response_address: String,
}

/// Unpin request pushed to an executor thread
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UnpinRequest {
    pub name: String,
}

/// Transient overload signal from an executor thread
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub ip: String,
    pub tid: u32,
}

/// A message between co-executing user functions
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub sender_ip: String,
    pub sender_tid: u32,
    pub payload: Vec<u8>,
}

/// GC notice pushed to a versioned cache after a causal sink write
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GcNotice {
    pub client_id: String,
    pub keys: Vec<String>,
}

/// A storage server's addresses within one tier
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerLocation {
    pub public_ip: String,
    pub private_ip: String,
}

/// One storage tier's membership
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Tier {
    pub tier_id: u32,
    pub servers: Vec<ServerLocation>,
}

/// Hash-ring membership as reported by a routing node
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TierMembership {
    pub tiers: Vec<Tier>,
}

/// Typed depart notification for hash-ring pruning
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeDepart {
    pub tier_id: u32,
    pub public_ip: String,
    pub private_ip: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ResponseError::Success as u8, 0);
        assert_eq!(ResponseError::InvalidTarget as u8, 1);
        assert_eq!(ResponseError::FuncNotFound as u8, 2);
        assert_eq!(ResponseError::NoSuchDag as u8, 3);
        assert_eq!(ResponseError::NotPinned as u8, 4);
        assert_eq!(ResponseError::ExecError as u8, 5);
    }

    #[test]
    fn test_payload_type_codes_are_stable() {
        assert_eq!(PayloadType::Default as u8, 0);
        assert_eq!(PayloadType::String as u8, 1);
        assert_eq!(PayloadType::Numpy as u8, 2);
    }

    #[test]
    fn test_vector_clock_merge_takes_pairwise_max() {
        let mut lhs = VectorClock::default();
        lhs.0.insert("a".to_string(), 3);
        lhs.0.insert("b".to_string(), 1);

        let mut rhs = VectorClock::default();
        rhs.0.insert("b".to_string(), 4);
        rhs.0.insert("c".to_string(), 2);

        lhs.merge(&rhs);
        assert_eq!(lhs.0["a"], 3);
        assert_eq!(lhs.0["b"], 4);
        assert_eq!(lhs.0["c"], 2);
    }

    #[test]
    fn test_vector_clock_bump_inserts_and_increments() {
        let mut vc = VectorClock::default();
        vc.bump("client");
        vc.bump("client");
        assert_eq!(vc.0["client"], 2);
    }

    #[test]
    fn test_generic_response_roundtrip() {
        let resp = GenericResponse::err(ResponseError::NoSuchDag);
        let bytes = crate::to_bytes(&resp).unwrap();
        let decoded: GenericResponse = crate::from_bytes(&bytes).unwrap();
        assert!(!decoded.success);
        assert_eq!(decoded.error, ResponseError::NoSuchDag);
    }
}
