//! In-memory KVS
//!
//! Backs every test and single-node local cluster. Honors the same lattice
//! merge semantics as the real store.

use crate::{CausalGetResult, KvsClient, KvsResult, LwwPair};
use async_trait::async_trait;
use nimbus_proto::messages::{CausalLevel, VectorClock, VersionedKey};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct CausalRecord {
    vector_clock: VectorClock,
    #[allow(dead_code)]
    deps: Vec<VersionedKey>,
    value: Vec<u8>,
}

/// A process-local KVS with LWW and causal tables
#[derive(Default)]
pub struct MemoryKvs {
    lww: Mutex<HashMap<String, LwwPair>>,
    causal: Mutex<HashMap<String, CausalRecord>>,
    /// When set, causal reads report this address as the serving cache
    cache_address: Option<String>,
}

impl MemoryKvs {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose causal reads claim to be served by `addr`; lets tests
    /// observe GC notifications
    pub fn with_cache_address(addr: impl Into<String>) -> Self {
        MemoryKvs {
            cache_address: Some(addr.into()),
            ..Default::default()
        }
    }

    /// Direct read used by assertions
    pub fn peek(&self, key: &str) -> Option<LwwPair> {
        self.lww.lock().get(key).cloned()
    }

    /// Direct causal read used by assertions
    pub fn peek_causal(&self, key: &str) -> Option<(VectorClock, Vec<u8>)> {
        self.causal
            .lock()
            .get(key)
            .map(|r| (r.vector_clock.clone(), r.value.clone()))
    }

    /// Number of LWW keys present
    pub fn len(&self) -> usize {
        self.lww.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lww.lock().is_empty()
    }
}

#[async_trait]
impl KvsClient for MemoryKvs {
    async fn get(&self, keys: &[String]) -> KvsResult<HashMap<String, LwwPair>> {
        let table = self.lww.lock();
        Ok(keys
            .iter()
            .filter_map(|k| table.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn put(&self, key: &str, value: LwwPair) -> KvsResult<()> {
        let mut table = self.lww.lock();
        let merged = match table.remove(key) {
            Some(existing) => existing.merge(value),
            None => value,
        };
        table.insert(key.to_string(), merged);
        Ok(())
    }

    async fn causal_get(
        &self,
        keys: &[String],
        _future_read_set: &[String],
        _level: CausalLevel,
        _client_id: &str,
    ) -> KvsResult<CausalGetResult> {
        let table = self.causal.lock();
        let pairs: HashMap<String, (VectorClock, Vec<u8>)> = keys
            .iter()
            .filter_map(|k| {
                table
                    .get(k)
                    .map(|r| (k.clone(), (r.vector_clock.clone(), r.value.clone())))
            })
            .collect();

        let cache = self.cache_address.as_ref().map(|addr| {
            let versions = pairs
                .iter()
                .map(|(key, (vc, _))| VersionedKey {
                    key: key.clone(),
                    vector_clock: vc.clone(),
                })
                .collect();
            (addr.clone(), versions)
        });

        Ok(CausalGetResult { cache, pairs })
    }

    async fn causal_put(
        &self,
        key: &str,
        vector_clock: VectorClock,
        deps: Vec<VersionedKey>,
        value: Vec<u8>,
        _client_id: &str,
    ) -> KvsResult<bool> {
        let mut table = self.causal.lock();
        let merged_clock = match table.remove(key) {
            Some(existing) => {
                let mut clock = existing.vector_clock;
                clock.merge(&vector_clock);
                clock
            }
            None => vector_clock,
        };
        table.insert(
            key.to_string(),
            CausalRecord {
                vector_clock: merged_clock,
                deps,
                value,
            },
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_omits_missing_keys() {
        let kvs = MemoryKvs::new();
        kvs.put("present", LwwPair::now(0, b"x".to_vec()))
            .await
            .unwrap();

        let found = kvs
            .get(&["present".to_string(), "absent".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("present"));
    }

    #[tokio::test]
    async fn test_put_merges_under_lww() {
        let kvs = MemoryKvs::new();
        kvs.put(
            "k",
            LwwPair {
                timestamp: 20,
                value: b"newer".to_vec(),
            },
        )
        .await
        .unwrap();
        kvs.put(
            "k",
            LwwPair {
                timestamp: 10,
                value: b"older".to_vec(),
            },
        )
        .await
        .unwrap();

        assert_eq!(kvs.peek("k").unwrap().value, b"newer");
    }

    #[tokio::test]
    async fn test_causal_put_merges_clocks() {
        let kvs = MemoryKvs::new();
        kvs.causal_put(
            "k",
            VectorClock::singleton("a"),
            Vec::new(),
            b"one".to_vec(),
            "a",
        )
        .await
        .unwrap();
        kvs.causal_put(
            "k",
            VectorClock::singleton("b"),
            Vec::new(),
            b"two".to_vec(),
            "b",
        )
        .await
        .unwrap();

        let (clock, value) = kvs.peek_causal("k").unwrap();
        assert_eq!(clock.0.len(), 2);
        assert_eq!(value, b"two");
    }

    #[tokio::test]
    async fn test_cache_address_reported_on_causal_reads() {
        let kvs = MemoryKvs::with_cache_address("10.0.0.9:6450");
        kvs.causal_put(
            "k",
            VectorClock::singleton("c"),
            Vec::new(),
            b"v".to_vec(),
            "c",
        )
        .await
        .unwrap();

        let result = kvs
            .causal_get(&["k".to_string()], &[], CausalLevel::Single, "c")
            .await
            .unwrap();
        let (addr, versions) = result.cache.unwrap();
        assert_eq!(addr, "10.0.0.9:6450");
        assert_eq!(versions.len(), 1);
    }
}
