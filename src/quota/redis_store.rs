use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;

use super::{QuotaStoreError, WindowCount, WindowStore};

/// Prune, count, conditionally insert and refresh expiry in one round trip.
/// Returns `{admitted, count, reset_ms}`.
static SLIDING_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  count = count + 1
  admitted = 1
end
redis.call('PEXPIRE', key, window)
local reset = window
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
  reset = tonumber(oldest[2]) + window - now
end
return {admitted, count, reset}
"#,
    )
});

/// Increment with expiry set on the first hit.  Returns `{count, ttl_ms}`.
static FIXED_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#,
    )
});

/// Window store shared by every gateway replica.
#[derive(Clone)]
pub struct RedisWindowStore {
    manager: ConnectionManager,
}

impl RedisWindowStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url.to_string())
            .with_context(|| format!("failed to open redis for quota store: {redis_url}"))?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis for quota store")?;
        Ok(Self { manager })
    }

    fn sliding_key(key: &str) -> String {
        format!("gatewayops:quota:sliding:{key}")
    }

    fn fixed_key(key: &str) -> String {
        format!("gatewayops:quota:fixed:{key}")
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn admit_sliding(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now_ms: u64,
    ) -> Result<WindowCount, QuotaStoreError> {
        let mut conn = self.manager.clone();
        // Unique member so two admissions in the same millisecond both count.
        let member = format!("{now_ms}-{}", hex::encode(rand::random::<[u8; 6]>()));
        let (admitted, count, reset): (i64, i64, i64) = SLIDING_SCRIPT
            .key(Self::sliding_key(key))
            .arg(now_ms)
            .arg(window.as_millis() as u64)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(WindowCount {
            admitted: admitted == 1,
            count: count.max(0) as u64,
            reset_ms: reset.max(0) as u64,
        })
    }

    async fn admit_fixed(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<WindowCount, QuotaStoreError> {
        let mut conn = self.manager.clone();
        let (count, ttl): (i64, i64) = FIXED_SCRIPT
            .key(Self::fixed_key(key))
            .arg(window.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        let count = count.max(0) as u64;
        Ok(WindowCount {
            admitted: count <= limit,
            count,
            reset_ms: ttl.max(0) as u64,
        })
    }
}
