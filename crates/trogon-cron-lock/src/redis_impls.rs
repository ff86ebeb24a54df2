use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use crate::{error::CronError, traits::LockBackend};

/// Delete KEYS[1] only if it holds ARGV[1]. Returns 1 on delete, 0 otherwise.
const LUA_COMPARE_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Reset the TTL of KEYS[1] to ARGV[2] ms only if it holds ARGV[1].
const LUA_COMPARE_EXTEND: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// `LockBackend` on a single Redis server.
///
/// Holds a [`MultiplexedConnection`], which is cheap to clone and safe to
/// share across tasks; every clone of the backend pipelines over the same
/// socket.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
}

impl RedisBackend {
    pub async fn new(url: &str) -> Result<Self, CronError> {
        let client =
            redis::Client::open(url).map_err(|e| CronError::Connect(format!("{url}: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CronError::Connect(format!("{url}: {e}")))?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl LockBackend for RedisBackend {
    type Error = CronError;

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CronError> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CronError> {
        let value: Option<String> = self.conn.clone().get(key).await?;
        Ok(value)
    }

    async fn compare_delete(&self, key: &str, expected: &str) -> Result<bool, CronError> {
        let deleted: i64 = Script::new(LUA_COMPARE_DELETE)
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(deleted == 1)
    }

    async fn compare_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, CronError> {
        let extended: i64 = Script::new(LUA_COMPARE_EXTEND)
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(extended == 1)
    }
}
