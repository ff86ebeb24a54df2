use std::time::Duration;

use async_nats::jetstream::kv::{self, CreateErrorKind, Operation};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{error::CronError, kv::encode_key, traits::LockBackend};

/// Value stored under a lock key.
///
/// JetStream KV has no per-key TTL, so expiry is part of the record and every
/// reader treats an expired record as absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockRecord {
    owner: String,
    expires_at_ms: i64,
}

impl LockRecord {
    fn new(owner: &str, ttl: Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            owner: owner.to_string(),
            expires_at_ms: now_ms().saturating_add(ttl_ms),
        }
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }

    fn encode(&self) -> Result<Bytes, CronError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// What a key currently holds, as seen by lock semantics.
enum Slot {
    /// No live lock. `revision` is set when a tombstone or expired record must
    /// be overwritten with a revision check.
    Vacant { revision: Option<u64> },
    Held { revision: u64, record: LockRecord },
}

/// `LockBackend` on a JetStream KV bucket.
///
/// Every write is conditional on the revision last read (`create`,
/// `update`, `delete_expect_revision`), so two instances racing for the same
/// expired record cannot both win. Expiry is compared against each
/// instance's wall clock; hosts need reasonably synchronized clocks.
#[derive(Clone)]
pub struct NatsKvBackend {
    store: kv::Store,
}

impl NatsKvBackend {
    pub fn new(store: kv::Store) -> Self {
        Self { store }
    }

    async fn slot(&self, key: &str) -> Result<Slot, CronError> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| CronError::Kv(e.to_string()))?;
        let Some(entry) = entry else {
            return Ok(Slot::Vacant { revision: None });
        };
        if entry.operation != Operation::Put {
            return Ok(Slot::Vacant {
                revision: Some(entry.revision),
            });
        }
        match serde_json::from_slice::<LockRecord>(&entry.value) {
            Ok(record) if !record.is_expired(now_ms()) => Ok(Slot::Held {
                revision: entry.revision,
                record,
            }),
            Ok(_) => Ok(Slot::Vacant {
                revision: Some(entry.revision),
            }),
            Err(e) => {
                tracing::warn!(key, error = %e, "Unreadable lock record, treating as expired");
                Ok(Slot::Vacant {
                    revision: Some(entry.revision),
                })
            }
        }
    }

    /// A failed conditional write is a lost race as long as the bucket still
    /// answers; otherwise it is a backend error.
    async fn lost_race(&self, key: &str, error: impl std::fmt::Display) -> Result<bool, CronError> {
        self.store
            .entry(key)
            .await
            .map_err(|e| CronError::Kv(e.to_string()))?;
        tracing::debug!(key, error = %error, "Conditional lock write lost");
        Ok(false)
    }

    async fn update(&self, key: &str, record: &LockRecord, revision: u64) -> Result<bool, CronError> {
        match self.store.update(key, record.encode()?, revision).await {
            Ok(_) => Ok(true),
            Err(e) => self.lost_race(key, e).await,
        }
    }
}

impl LockBackend for NatsKvBackend {
    type Error = CronError;

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CronError> {
        let key = encode_key(key);
        let record = LockRecord::new(value, ttl);
        match self.store.create(&key, record.encode()?).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == CreateErrorKind::AlreadyExists => match self.slot(&key).await? {
                Slot::Vacant {
                    revision: Some(revision),
                } => self.update(&key, &record, revision).await,
                Slot::Vacant { revision: None } | Slot::Held { .. } => Ok(false),
            },
            Err(e) => Err(CronError::Kv(e.to_string())),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CronError> {
        match self.slot(&encode_key(key)).await? {
            Slot::Held { record, .. } => Ok(Some(record.owner)),
            Slot::Vacant { .. } => Ok(None),
        }
    }

    async fn compare_delete(&self, key: &str, expected: &str) -> Result<bool, CronError> {
        let key = encode_key(key);
        match self.slot(&key).await? {
            Slot::Held { revision, record } if record.owner == expected => {
                match self.store.delete_expect_revision(&key, Some(revision)).await {
                    Ok(()) => Ok(true),
                    Err(e) => self.lost_race(&key, e).await,
                }
            }
            _ => Ok(false),
        }
    }

    async fn compare_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, CronError> {
        let key = encode_key(key);
        match self.slot(&key).await? {
            Slot::Held { revision, record } if record.owner == expected => {
                self.update(&key, &LockRecord::new(expected, ttl), revision).await
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_expires_after_ttl() {
        let record = LockRecord::new("10.0.0.1:abc", Duration::from_secs(30));
        let now = now_ms();
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + 30_001));
    }

    #[test]
    fn record_wire_format() {
        let record = LockRecord {
            owner: "10.0.0.1:abc".to_string(),
            expires_at_ms: 1_700_000_000_000,
        };
        let json: serde_json::Value = serde_json::from_slice(&record.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"owner": "10.0.0.1:abc", "expires_at_ms": 1_700_000_000_000_i64})
        );
    }

    #[test]
    fn zero_ttl_record_is_already_expired() {
        let record = LockRecord::new("me", Duration::ZERO);
        assert!(record.is_expired(record.expires_at_ms));
    }
}
