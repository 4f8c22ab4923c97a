//! Remote KVS client
//!
//! Speaks the `KeyRequest`/`KeyResponse` and `CausalRequest`/`CausalResponse`
//! wire exchange against the storage layer. Key addresses come from a
//! routing-layer lookup and are cached per key; responses may carry
//! `invalidate` hints that repair a stale cache entry.

use crate::{CausalGetResult, KvsClient, KvsError, KvsResult, LwwPair};
use async_trait::async_trait;
use nimbus_fabric::KVS_TIMEOUT;
use nimbus_proto::messages::{
    tuple_error, CausalLevel, CausalRequest, CausalResponse, CausalTuple, KeyRequest,
    KeyRequestType, KeyResponse, KeySet, KeyTuple, VectorClock, VersionedKey,
};
use nimbus_proto::{from_bytes, to_bytes};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

/// KVS client backed by the live storage layer
pub struct RemoteKvsClient {
    route_addr: String,
    my_ip: String,
    address_cache: Mutex<HashMap<String, Vec<String>>>,
}

impl RemoteKvsClient {
    /// Client routed through `route_addr`, identifying itself as `my_ip`
    pub fn new(route_addr: impl Into<String>, my_ip: impl Into<String>) -> Self {
        RemoteKvsClient {
            route_addr: route_addr.into(),
            my_ip: my_ip.into(),
            address_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of keys with cached addresses; reported on requests so the
    /// store can detect staleness
    fn cache_size(&self) -> u32 {
        self.address_cache.lock().len() as u32
    }

    /// Resolve the serving address for `key`, consulting the routing layer
    /// on a cache miss
    async fn key_address(&self, key: &str) -> KvsResult<String> {
        if let Some(addrs) = self.address_cache.lock().get(key) {
            if let Some(addr) = addrs.first() {
                return Ok(addr.clone());
            }
        }

        let query = to_bytes(&KeySet {
            keys: vec![key.to_string()],
        })?;
        let reply = nimbus_fabric::request(&self.route_addr, &query, KVS_TIMEOUT).await?;
        let addrs: KeySet = from_bytes(&reply)?;

        if addrs.keys.is_empty() {
            return Err(KvsError::NoAddress(key.to_string()));
        }

        let addr = addrs.keys[0].clone();
        self.address_cache
            .lock()
            .insert(key.to_string(), addrs.keys);
        Ok(addr)
    }

    /// Drop a stale cache entry, optionally installing the repair hint
    fn repair_cache(&self, key: &str, replacement: &[String]) {
        let mut cache = self.address_cache.lock();
        if replacement.is_empty() {
            cache.remove(key);
        } else {
            cache.insert(key.to_string(), replacement.to_vec());
        }
    }

    /// One `KeyRequest` exchange; retries once per key on a wrong-thread or
    /// invalidate response after repairing the cache
    async fn exchange(&self, r#type: KeyRequestType, tuples: Vec<KeyTuple>) -> KvsResult<Vec<KeyTuple>> {
        let mut pending = tuples;
        let mut resolved = Vec::new();
        let mut retried = false;

        while !pending.is_empty() {
            // Group tuples by serving address so each node sees one request.
            let mut by_addr: HashMap<String, Vec<KeyTuple>> = HashMap::new();
            for tuple in pending.drain(..) {
                let addr = self.key_address(&tuple.key).await?;
                by_addr.entry(addr).or_default().push(tuple);
            }

            let mut stale = Vec::new();
            for (addr, batch) in by_addr {
                let request = KeyRequest {
                    request_id: Uuid::new_v4().to_string(),
                    r#type,
                    response_address: self.my_ip.clone(),
                    tuples: batch,
                };
                let reply =
                    nimbus_fabric::request(&addr, &to_bytes(&request)?, KVS_TIMEOUT).await?;
                let response: KeyResponse = from_bytes(&reply)?;

                for tuple in response.tuples {
                    if tuple.invalidate || tuple.error == tuple_error::WRONG_THREAD {
                        self.repair_cache(&tuple.key, &tuple.addresses);
                        stale.push(KeyTuple {
                            key: tuple.key,
                            payload: tuple.payload,
                            lattice_type: tuple.lattice_type,
                            timestamp: tuple.timestamp,
                            address_cache_size: self.cache_size(),
                            ..Default::default()
                        });
                    } else {
                        resolved.push(tuple);
                    }
                }
            }

            if !stale.is_empty() {
                if retried {
                    // Two stale rounds in a row; surface what we have.
                    resolved.extend(stale);
                    break;
                }
                retried = true;
                pending = stale;
            }
        }

        Ok(resolved)
    }
}

#[async_trait]
impl KvsClient for RemoteKvsClient {
    async fn get(&self, keys: &[String]) -> KvsResult<HashMap<String, LwwPair>> {
        let tuples = keys
            .iter()
            .map(|key| KeyTuple {
                key: key.clone(),
                address_cache_size: self.cache_size(),
                ..Default::default()
            })
            .collect();

        let resolved = self.exchange(KeyRequestType::Get, tuples).await?;
        Ok(resolved
            .into_iter()
            .filter(|t| t.error == tuple_error::OK)
            .map(|t| {
                (
                    t.key,
                    LwwPair {
                        timestamp: t.timestamp,
                        value: t.payload,
                    },
                )
            })
            .collect())
    }

    async fn put(&self, key: &str, value: LwwPair) -> KvsResult<()> {
        let tuple = KeyTuple {
            key: key.to_string(),
            payload: value.value,
            timestamp: value.timestamp,
            address_cache_size: self.cache_size(),
            ..Default::default()
        };
        self.exchange(KeyRequestType::Put, vec![tuple]).await?;
        Ok(())
    }

    async fn causal_get(
        &self,
        keys: &[String],
        future_read_set: &[String],
        level: CausalLevel,
        client_id: &str,
    ) -> KvsResult<CausalGetResult> {
        let addr = match keys.first() {
            Some(first) => self.key_address(first).await?,
            None => return Ok(CausalGetResult::default()),
        };

        let request = CausalRequest {
            request_id: Uuid::new_v4().to_string(),
            r#type: KeyRequestType::Get,
            response_address: self.my_ip.clone(),
            consistency: level,
            client_id: client_id.to_string(),
            future_read_set: future_read_set.to_vec(),
            tuples: keys
                .iter()
                .map(|key| CausalTuple {
                    key: key.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let reply = nimbus_fabric::request(&addr, &to_bytes(&request)?, KVS_TIMEOUT).await?;
        let response: CausalResponse = from_bytes(&reply)?;

        let cache = response.versioned_key_locations.into_iter().next();

        let pairs = response
            .tuples
            .into_iter()
            .filter(|t| t.error == tuple_error::OK)
            .map(|t| (t.key, (t.vector_clock, t.payload)))
            .collect();

        Ok(CausalGetResult { cache, pairs })
    }

    async fn causal_put(
        &self,
        key: &str,
        vector_clock: VectorClock,
        deps: Vec<VersionedKey>,
        value: Vec<u8>,
        client_id: &str,
    ) -> KvsResult<bool> {
        let addr = self.key_address(key).await?;

        let request = CausalRequest {
            request_id: Uuid::new_v4().to_string(),
            r#type: KeyRequestType::Put,
            response_address: self.my_ip.clone(),
            consistency: CausalLevel::Cross,
            client_id: client_id.to_string(),
            vector_clock,
            deps,
            tuples: vec![CausalTuple {
                key: key.to_string(),
                payload: value,
                ..Default::default()
            }],
            ..Default::default()
        };

        let reply = nimbus_fabric::request(&addr, &to_bytes(&request)?, KVS_TIMEOUT).await?;
        let response: CausalResponse = from_bytes(&reply)?;
        Ok(response
            .tuples
            .first()
            .map(|t| t.error == tuple_error::OK)
            .unwrap_or(false))
    }
}
