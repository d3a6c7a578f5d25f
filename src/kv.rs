use crate::error::{Error, Result, StoreError};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Shared, network-addressable key-value store.
///
/// This is the only state shared between processes, so every cross-process
/// guarantee (cache coherence, lock exclusivity) rests on the atomicity of
/// these operations. String values and sets live in one keyspace, as in Redis.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns the value at `key` if present and unexpired.
    async fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StoreError>;

    /// Stores `value` at `key`, replacing any previous value.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<(), StoreError>;

    /// Atomically stores `value` only when `key` holds no live value.
    ///
    /// Returns true when the value was written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<bool, StoreError>;

    /// Deletes `key`. Returns true when a live value was removed.
    async fn delete(&self, key: &str) -> std::result::Result<bool, StoreError>;

    /// Atomically deletes `key` only when it currently holds `expected`.
    async fn delete_if_equals(
        &self,
        key: &str,
        expected: &[u8],
    ) -> std::result::Result<bool, StoreError>;

    /// Remaining lifetime of `key`; `None` when missing or persistent.
    async fn ttl(&self, key: &str) -> std::result::Result<Option<Duration>, StoreError>;

    /// Sets the lifetime of an existing key. Returns false when missing.
    async fn expire(&self, key: &str, ttl: Duration) -> std::result::Result<bool, StoreError>;

    /// Adds `member` to the set at `key`, creating it when needed.
    async fn set_add(&self, key: &str, member: &str) -> std::result::Result<(), StoreError>;

    /// Removes `member` from the set at `key`; empty sets disappear.
    async fn set_remove(&self, key: &str, member: &str) -> std::result::Result<(), StoreError>;

    /// Returns every member of the set at `key`.
    async fn set_members(&self, key: &str) -> std::result::Result<Vec<String>, StoreError>;
}

/// Runs one store call under a bounded timeout.
///
/// Backend errors map to [`Error::StoreUnavailable`] and an elapsed timeout
/// to [`Error::StoreTimeout`]; callers decide whether that means "miss" or
/// "failure".
pub(crate) async fn bounded<T, F>(operation: &'static str, timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(Error::unavailable(operation, source)),
        Err(_) => Err(Error::StoreTimeout { operation, timeout }),
    }
}

/// Joins key segments with `:`.
pub(crate) fn key(segments: &[&str]) -> String {
    segments.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_should_map_backend_errors() {
        let result: Result<()> = bounded("get", Duration::from_secs(1), async {
            Err::<(), StoreError>("connection refused".into())
        })
        .await;
        assert!(matches!(
            result,
            Err(Error::StoreUnavailable { operation: "get", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_should_time_out_slow_calls() {
        let result = bounded("get", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, StoreError>(1)
        })
        .await;
        assert!(matches!(result, Err(Error::StoreTimeout { .. })));
        assert!(result.unwrap_err().is_store_unavailable());
    }

    #[test]
    fn key_should_join_segments() {
        assert_eq!(key(&["lock", "t1", "listing", "9"]), "lock:t1:listing:9");
    }
}
