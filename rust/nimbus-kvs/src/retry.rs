//! Bounded retry policy
//!
//! Retry-until-present reads are bounded: each attempt carries a 1 s
//! timeout, backoff doubles between attempts, and a 30 s cumulative cap
//! surfaces `KvsError::Unavailable` instead of spinning forever.

use crate::{KvsClient, KvsError, KvsResult, LwwPair};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Timeout applied to each individual attempt
pub const RETRY_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Cumulative cap across all attempts
pub const RETRY_CUMULATIVE_CAP: Duration = Duration::from_secs(30);

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Get that retries until every requested key is present
pub async fn get_with_retry(
    kvs: &dyn KvsClient,
    keys: &[String],
) -> KvsResult<HashMap<String, LwwPair>> {
    let deadline = Instant::now() + RETRY_CUMULATIVE_CAP;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let attempt = tokio::time::timeout(RETRY_ATTEMPT_TIMEOUT, kvs.get(keys)).await;

        match attempt {
            Ok(Ok(found)) if found.len() == keys.len() => return Ok(found),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                tracing::debug!("kvs get attempt failed: {err}");
            }
            Err(_) => {
                tracing::debug!("kvs get attempt timed out");
            }
        }

        if Instant::now() + backoff > deadline {
            return Err(KvsError::Unavailable(format!(
                "keys {keys:?} not readable within {RETRY_CUMULATIVE_CAP:?}"
            )));
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RETRY_ATTEMPT_TIMEOUT);
    }
}

/// Get a single key with the bounded retry policy
pub async fn get_one_with_retry(kvs: &dyn KvsClient, key: &str) -> KvsResult<LwwPair> {
    let keys = vec![key.to_string()];
    let mut found = get_with_retry(kvs, &keys).await?;
    found
        .remove(key)
        .ok_or_else(|| KvsError::Unavailable(format!("key {key} missing after retry")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKvs;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_returns_once_all_keys_present() {
        let kvs = Arc::new(MemoryKvs::new());
        kvs.put("a", LwwPair::now(0, b"1".to_vec())).await.unwrap();

        let writer = kvs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            writer.put("b", LwwPair::now(0, b"2".to_vec())).await.unwrap();
        });

        let found = get_with_retry(kvs.as_ref(), &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_surfaces_unavailable_at_the_cap() {
        let kvs = MemoryKvs::new();
        let err = get_with_retry(&kvs, &["never".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, KvsError::Unavailable(_)));
    }
}
