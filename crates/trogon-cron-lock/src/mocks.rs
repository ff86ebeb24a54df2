//! In-memory lock backend for unit testing without Redis or NATS.
//!
//! Enabled with the `test-support` feature:
//!
//! ```toml
//! [dev-dependencies]
//! trogon-cron-lock = { path = "...", features = ["test-support"] }
//! ```

use std::collections::HashMap;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::time::Duration;

use tokio::time::Instant;

use crate::traits::LockBackend;

// ── InMemoryBackend ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Linearizable map with per-key TTLs on Tokio's clock.
///
/// Clones share state, so two `LeaseLock`s built on clones behave like two
/// processes talking to the same server. TTLs follow `tokio::time`, which
/// makes expiry deterministic under `#[tokio::test(start_paused = true)]`.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    unavailable: Arc<AtomicBool>,
    extends: Arc<AtomicUsize>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a backend outage: every operation fails until restored.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite `key` as if another process had taken it.
    pub fn force_set(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.lock().unwrap().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop `key` without going through the lock API.
    pub fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Keys that are present and not expired, sorted.
    pub fn live_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Successful compare-and-extend calls so far.
    pub fn extend_count(&self) -> usize {
        self.extends.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), MockBackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(MockBackendError("backend unavailable"))
        } else {
            Ok(())
        }
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[derive(Debug)]
pub struct MockBackendError(pub &'static str);

impl std::fmt::Display for MockBackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MockBackendError {}

impl LockBackend for InMemoryBackend {
    type Error = MockBackendError;

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, MockBackendError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap();
        if Self::live_value(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, MockBackendError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap();
        Ok(Self::live_value(&mut entries, key))
    }

    async fn compare_delete(&self, key: &str, expected: &str) -> Result<bool, MockBackendError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap();
        if Self::live_value(&mut entries, key).as_deref() == Some(expected) {
            entries.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn compare_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, MockBackendError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap();
        if Self::live_value(&mut entries, key).as_deref() != Some(expected) {
            return Ok(false);
        }
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Instant::now() + ttl;
        }
        self.extends.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}
