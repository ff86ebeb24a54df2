use std::future::Future;
use std::time::Duration;

/// Storage contract behind a distributed lease.
///
/// Four atomic operations are the whole contract. Any linearizable store that
/// offers them can back a [`LeaseLock`](crate::LeaseLock): Redis, NATS KV, or
/// the in-memory double used in tests.
pub trait LockBackend: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync;

    /// Store `value` under `key` with expiry `ttl` unless the key already exists.
    /// Returns `true` when this call created the key.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Current value of `key`, `None` if absent or expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send;

    /// Delete `key` only if it currently holds `expected`.
    fn compare_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Reset the expiry of `key` to `ttl` only if it currently holds `expected`.
    fn compare_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;
}
