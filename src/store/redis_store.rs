//! Redis-backed counter store.
//!
//! The fixed-window protocol runs as a single Lua script, so the existence
//! check, the increment, the stamping of `reset_at` and the expiry all happen
//! in one atomic step on the server. The window start comes from the Redis
//! clock, which makes the reset instant identical for every service instance
//! regardless of local clock skew.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::StoreError;
use crate::ratelimit::{CounterBackend, CounterKey, CounterReading};

/// Atomically count one hit for `KEYS[1]` in a window of `ARGV[1]` milliseconds.
///
/// Returns `{count, reset_at_ms}`. A hash without `reset_at` (written by
/// something else) is treated as a fresh window rather than trusted.
///
/// Writes follow the non-deterministic `TIME`; Redis before 5.0 only accepts
/// that with effects replication switched on first.
const INCREMENT_SCRIPT: &str = r#"
redis.replicate_commands()
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
local reset_at = tonumber(redis.call('HGET', KEYS[1], 'reset_at'))
if count == 1 or reset_at == nil then
  local now = redis.call('TIME')
  reset_at = tonumber(now[1]) * 1000 + math.floor(tonumber(now[2]) / 1000) + tonumber(ARGV[1])
  count = 1
  redis.call('HSET', KEYS[1], 'count', count, 'reset_at', reset_at)
  redis.call('PEXPIREAT', KEYS[1], reset_at)
end
return {count, reset_at}
"#;

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// A counter store shared by every instance pointing at the same Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    script: Script,
}

impl RedisStore {
    /// Connect to Redis. The connection reconnects on its own after failures.
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self, StoreError> {
        info!(url = %redact_url(&config.url), "Connecting to Redis counter store");

        let client =
            Client::open(config.url.as_str()).map_err(|e| StoreError::Connection(e.to_string()))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!("Connected to Redis counter store");

        Ok(Self {
            connection,
            script: Script::new(INCREMENT_SCRIPT),
        })
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("script_hash", &self.script.get_hash())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CounterBackend for RedisStore {
    async fn increment(&self, key: &CounterKey, window_secs: u32) -> Result<CounterReading, StoreError> {
        let store_key = key.to_store_key();
        let window_ms = u64::from(window_secs) * 1000;
        let mut connection = self.connection.clone();

        trace!(key = %store_key, window_ms = window_ms, "Running increment script");

        let (count, reset_ms): (i64, i64) = self
            .script
            .key(&store_key)
            .arg(window_ms)
            .invoke_async(&mut connection)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;

        let count = u64::try_from(count)
            .map_err(|_| StoreError::InvalidReply(format!("negative count {}", count)))?;
        let reset_at = DateTime::<Utc>::from_timestamp_millis(reset_ms)
            .ok_or_else(|| StoreError::InvalidReply(format!("reset timestamp {} out of range", reset_ms)))?;

        if count == 1 {
            debug!(key = %store_key, reset_at = %reset_at, "Opened new window");
        }

        Ok(CounterReading::new(count, reset_at))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

/// Strip credentials from a connection URL before logging it.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
