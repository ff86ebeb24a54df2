use std::time::Duration;

use async_nats::jetstream;

use crate::{
    config::LockBackendConfig, error::CronError, kv::get_or_create_lock_bucket,
    nats_impls::NatsKvBackend, redis_impls::RedisBackend, traits::LockBackend,
};

/// Lock backend chosen at runtime from configuration.
#[derive(Clone)]
pub enum Backend {
    Redis(RedisBackend),
    Nats(NatsKvBackend),
}

impl Backend {
    pub async fn connect(config: &LockBackendConfig) -> Result<Self, CronError> {
        match config {
            LockBackendConfig::Redis { url } => {
                tracing::info!(url = %url, "Connecting to Redis lock backend");
                Ok(Backend::Redis(RedisBackend::new(url).await?))
            }
            LockBackendConfig::Nats { url, bucket } => {
                tracing::info!(url = %url, bucket = %bucket, "Connecting to NATS KV lock backend");
                let client = async_nats::connect(url.as_str())
                    .await
                    .map_err(|e| CronError::Connect(format!("{url}: {e}")))?;
                let js = jetstream::new(client);
                let store = get_or_create_lock_bucket(&js, bucket).await?;
                Ok(Backend::Nats(NatsKvBackend::new(store)))
            }
        }
    }
}

impl LockBackend for Backend {
    type Error = CronError;

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CronError> {
        match self {
            Backend::Redis(b) => b.set_if_absent(key, value, ttl).await,
            Backend::Nats(b) => b.set_if_absent(key, value, ttl).await,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CronError> {
        match self {
            Backend::Redis(b) => b.get(key).await,
            Backend::Nats(b) => b.get(key).await,
        }
    }

    async fn compare_delete(&self, key: &str, expected: &str) -> Result<bool, CronError> {
        match self {
            Backend::Redis(b) => b.compare_delete(key, expected).await,
            Backend::Nats(b) => b.compare_delete(key, expected).await,
        }
    }

    async fn compare_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, CronError> {
        match self {
            Backend::Redis(b) => b.compare_extend(key, expected, ttl).await,
            Backend::Nats(b) => b.compare_extend(key, expected, ttl).await,
        }
    }
}
