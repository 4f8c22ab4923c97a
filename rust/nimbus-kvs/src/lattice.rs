//! Lattice types
//!
//! Only the last-writer-wins pair crosses the compute plane's KVS boundary;
//! causal state travels as `(vector_clock, value)` pairs on the causal
//! interface.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A last-writer-wins `(timestamp, value)` pair
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct LwwPair {
    pub timestamp: u64,
    pub value: Vec<u8>,
}

impl LwwPair {
    /// Pair stamped with the current time for thread `tid`
    pub fn now(tid: u32, value: Vec<u8>) -> Self {
        LwwPair {
            timestamp: generate_timestamp(tid),
            value,
        }
    }

    /// Merge under LWW semantics; the larger timestamp wins
    pub fn merge(self, other: LwwPair) -> LwwPair {
        if other.timestamp > self.timestamp {
            other
        } else {
            self
        }
    }
}

/// Timestamp unique per `(instant, tid)`: wall-clock microseconds shifted
/// past the thread id's decimal width, plus the thread id
pub fn generate_timestamp(tid: u32) -> u64 {
    let micros = Utc::now().timestamp_micros() as u64;

    let mut p = 10u64;
    while tid as u64 >= p {
        p *= 10;
    }

    micros * p + tid as u64
}
