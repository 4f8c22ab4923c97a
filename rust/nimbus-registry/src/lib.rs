//! Function and DAG registry
//!
//! A durable index kept in the KVS: function bodies live under the `funcs/`
//! prefix, the list of all function names is itself a key holding a
//! serialized, deduplicated name list, and DAG definitions are stored under
//! their own names. Function bodies are cached locally in an LRU.

use lru::LruCache;
use nimbus_kvs::{generate_timestamp, get_one_with_retry, KvsClient, KvsError, LwwPair};
use nimbus_proto::messages::Dag;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;

/// Prefix under which function bodies are stored
pub const FUNC_PREFIX: &str = "funcs/";

/// Key holding the serialized list of all function names
pub const FUNC_INDEX_KEY: &str = "funcs/index-allfuncs";

/// Prefix under which each executor advertises its cached keys
pub const CACHE_PREFIX: &str = "cache/";

/// Local cache capacity for function bodies
const BODY_CACHE_ENTRIES: usize = 100;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised by the registry
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The KVS could not be reached or stayed empty past the retry cap
    #[error(transparent)]
    Kvs(#[from] KvsError),

    /// A stored record failed to decode
    #[error("corrupt registry record for {key}: {source}")]
    Corrupt {
        key: String,
        source: bincode::Error,
    },
}

/// KVS name of a function
pub fn func_kvs_name(fname: &str) -> String {
    format!("{FUNC_PREFIX}{fname}")
}

/// KVS key of an executor node's cache index
pub fn cache_index_key(ip: &str) -> String {
    format!("{CACHE_PREFIX}{ip}")
}

/// KVS-backed registry with a local body cache
pub struct Registry {
    kvs: Arc<dyn KvsClient>,
    bodies: Mutex<LruCache<String, Vec<u8>>>,
}

impl Registry {
    pub fn new(kvs: Arc<dyn KvsClient>) -> Self {
        let capacity = NonZeroUsize::new(BODY_CACHE_ENTRIES)
            .unwrap_or(NonZeroUsize::MIN);
        Registry {
            kvs,
            bodies: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Store a function body and append its name to the index
    pub async fn create_function(&self, name: &str, body: Vec<u8>) -> RegistryResult<()> {
        let kvs_name = func_kvs_name(name);
        tracing::info!(function = name, "creating function");

        self.kvs
            .put(&kvs_name, LwwPair::now(0, body))
            .await?;

        let mut names = self.function_names(true).await?;
        names.push(kvs_name);
        self.put_function_names(names).await?;
        Ok(())
    }

    /// Fetch a function body, trying the local cache first; retries the KVS
    /// until the body appears or the retry cap expires
    pub async fn retrieve_function(&self, name: &str) -> RegistryResult<Vec<u8>> {
        if let Some(body) = self.bodies.lock().get(name) {
            return Ok(body.clone());
        }

        let pair = get_one_with_retry(self.kvs.as_ref(), &func_kvs_name(name)).await?;
        self.bodies.lock().put(name.to_string(), pair.value.clone());
        Ok(pair.value)
    }

    /// Single-attempt body lookup; `Ok(None)` when the function is absent
    pub async fn try_retrieve_function(&self, name: &str) -> RegistryResult<Option<Vec<u8>>> {
        if let Some(body) = self.bodies.lock().get(name) {
            return Ok(Some(body.clone()));
        }

        let kvs_name = func_kvs_name(name);
        let mut found = self.kvs.get(&[kvs_name.clone()]).await?;
        match found.remove(&kvs_name) {
            Some(pair) => {
                self.bodies.lock().put(name.to_string(), pair.value.clone());
                Ok(Some(pair.value))
            }
            None => Ok(None),
        }
    }

    /// All registered function names matching `prefix`, stripped of the
    /// storage prefix
    pub async fn list_functions(&self, prefix: &str) -> RegistryResult<Vec<String>> {
        let full_prefix = format!("{FUNC_PREFIX}{prefix}");
        let names = self.function_names(true).await?;
        Ok(names
            .into_iter()
            .filter(|n| n.starts_with(&full_prefix))
            .map(|n| n.trim_start_matches(FUNC_PREFIX).to_string())
            .collect())
    }

    /// Persist a validated DAG under its name
    pub async fn store_dag(&self, dag: &Dag) -> RegistryResult<()> {
        let payload = bincode::serialize(dag).map_err(|source| RegistryError::Corrupt {
            key: dag.name.clone(),
            source,
        })?;
        self.kvs
            .put(&dag.name, LwwPair::now(0, payload))
            .await?;
        Ok(())
    }

    /// Load a DAG, retrying until it is visible (gossiped DAGs may not have
    /// landed in the KVS yet from this replica's vantage)
    pub async fn load_dag(&self, name: &str) -> RegistryResult<Dag> {
        let pair = get_one_with_retry(self.kvs.as_ref(), name).await?;
        bincode::deserialize(&pair.value).map_err(|source| RegistryError::Corrupt {
            key: name.to_string(),
            source,
        })
    }

    /// Read the name index; names are deduplicated on load
    async fn function_names(&self, fullname: bool) -> RegistryResult<Vec<String>> {
        let mut found = self.kvs.get(&[FUNC_INDEX_KEY.to_string()]).await?;
        let Some(pair) = found.remove(FUNC_INDEX_KEY) else {
            return Ok(Vec::new());
        };

        let names: Vec<String> =
            bincode::deserialize(&pair.value).map_err(|source| RegistryError::Corrupt {
                key: FUNC_INDEX_KEY.to_string(),
                source,
            })?;

        let mut deduped: Vec<String> = Vec::new();
        for name in names {
            if !deduped.contains(&name) {
                deduped.push(name);
            }
        }

        if fullname {
            Ok(deduped)
        } else {
            Ok(deduped
                .into_iter()
                .map(|n| n.trim_start_matches(FUNC_PREFIX).to_string())
                .collect())
        }
    }

    /// Write the name index; names are deduplicated on write
    async fn put_function_names(&self, names: Vec<String>) -> RegistryResult<()> {
        let mut deduped: Vec<String> = Vec::new();
        for name in names {
            if !deduped.contains(&name) {
                deduped.push(name);
            }
        }

        let payload = bincode::serialize(&deduped).map_err(|source| RegistryError::Corrupt {
            key: FUNC_INDEX_KEY.to_string(),
            source,
        })?;
        self.kvs
            .put(
                FUNC_INDEX_KEY,
                LwwPair {
                    timestamp: generate_timestamp(0),
                    value: payload,
                },
            )
            .await?;
        Ok(())
    }
}
