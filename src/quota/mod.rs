//! Per-identity request quotas.
//!
//! The [`QuotaTracker`] owns the policy (window length, strategy and what to
//! do when the store fails); a [`WindowStore`] owns the counters and must
//! perform each check-and-update atomically.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::FailMode;

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryWindowStore;
pub use self::redis_store::RedisWindowStore;

#[derive(Debug, Error)]
pub enum QuotaStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("quota store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuotaStrategy {
    #[default]
    Sliding,
    Fixed,
}

impl std::str::FromStr for QuotaStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sliding" => Ok(QuotaStrategy::Sliding),
            "fixed" => Ok(QuotaStrategy::Fixed),
            other => Err(format!("unknown quota strategy '{other}'")),
        }
    }
}

/// Raw result of one atomic store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub admitted: bool,
    /// Requests counted in the window after this operation.
    pub count: u64,
    /// Milliseconds until the window frees a slot (sliding) or resets (fixed).
    pub reset_ms: u64,
}

#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Prune entries older than `now_ms - window`, then admit and record
    /// `now_ms` only if fewer than `limit` remain.
    async fn admit_sliding(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now_ms: u64,
    ) -> Result<WindowCount, QuotaStoreError>;

    /// Increment a counter that expires `window` after its first hit.
    async fn admit_fixed(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<WindowCount, QuotaStoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_seconds: u64,
}

pub struct QuotaTracker {
    store: Arc<dyn WindowStore>,
    strategy: QuotaStrategy,
    window: Duration,
    fail_mode: FailMode,
}

impl QuotaTracker {
    pub fn new(
        store: Arc<dyn WindowStore>,
        strategy: QuotaStrategy,
        window: Duration,
        fail_mode: FailMode,
    ) -> Self {
        Self {
            store,
            strategy,
            window,
            fail_mode,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn strategy(&self) -> QuotaStrategy {
        self.strategy
    }

    pub async fn admit(&self, key: &str, limit: u64) -> QuotaDecision {
        let result = match self.strategy {
            QuotaStrategy::Sliding => {
                let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
                self.store
                    .admit_sliding(key, limit, self.window, now_ms)
                    .await
            }
            QuotaStrategy::Fixed => self.store.admit_fixed(key, limit, self.window).await,
        };
        match result {
            Ok(wc) => QuotaDecision {
                allowed: wc.admitted,
                limit,
                remaining: limit.saturating_sub(wc.count),
                reset_seconds: ceil_secs(wc.reset_ms),
            },
            Err(err) => match self.fail_mode {
                FailMode::Open => {
                    tracing::error!(error = %err, quota_key = %key, "quota store failed; admitting (fail open)");
                    QuotaDecision {
                        allowed: true,
                        limit,
                        remaining: limit,
                        reset_seconds: self.window.as_secs(),
                    }
                }
                FailMode::Closed => {
                    tracing::error!(error = %err, quota_key = %key, "quota store failed; rejecting (fail closed)");
                    QuotaDecision {
                        allowed: false,
                        limit,
                        remaining: 0,
                        reset_seconds: self.window.as_secs().max(1),
                    }
                }
            },
        }
    }
}

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000).max(1)
}
