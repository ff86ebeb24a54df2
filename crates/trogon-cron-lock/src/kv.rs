use async_nats::jetstream::{self, kv};

use crate::error::CronError;

/// Default bucket for task locks.
pub const LOCK_BUCKET: &str = "cron_locks";

/// Open `bucket`, creating it on first use.
///
/// History is 1 and there is no `max_age`: lock expiry is carried in each
/// record, so one bucket serves leases of any length.
pub async fn get_or_create_lock_bucket(
    js: &jetstream::Context,
    bucket: &str,
) -> Result<kv::Store, CronError> {
    let config = kv::Config {
        bucket: bucket.to_string(),
        history: 1,
        ..Default::default()
    };
    match js.create_key_value(config).await {
        Ok(store) => Ok(store),
        Err(_) => js
            .get_key_value(bucket)
            .await
            .map_err(|e| CronError::Kv(e.to_string())),
    }
}

/// Map a lock name onto the KV key alphabet.
///
/// Letters, digits, `-`, `_` and `/` pass through; every other byte becomes
/// `=XX`. `cron:report` is stored as `cron=3Areport`.
pub fn encode_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'/' => key.push(byte as char),
            other => key.push_str(&format!("={other:02X}")),
        }
    }
    key
}
