use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::{QuotaStoreError, WindowCount, WindowStore};

const SWEEP_EVERY: u64 = 1024;

#[derive(Default)]
struct Sliding {
    stamps: VecDeque<u64>,
    window_ms: u64,
}

struct Fixed {
    count: u64,
    started: Instant,
    window: Duration,
}

/// Single-process window store.  Each admission runs while holding the
/// map shard lock for its key, so check-and-update is atomic per key.
#[derive(Default)]
pub struct MemoryWindowStore {
    sliding: DashMap<String, Sliding>,
    fixed: DashMap<String, Fixed>,
    ops: AtomicU64,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop windows with nothing left in them.
    pub fn sweep(&self, now_ms: u64) {
        self.sliding.retain(|_, s| {
            s.stamps
                .back()
                .map(|newest| *newest + s.window_ms > now_ms)
                .unwrap_or(false)
        });
        self.fixed.retain(|_, f| f.started.elapsed() < f.window);
    }

    pub fn tracked_keys(&self) -> usize {
        self.sliding.len() + self.fixed.len()
    }

    fn tick(&self, now_ms: u64) {
        if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep(now_ms);
        }
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn admit_sliding(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now_ms: u64,
    ) -> Result<WindowCount, QuotaStoreError> {
        let window_ms = window.as_millis() as u64;
        let result = {
            let mut entry = self.sliding.entry(key.to_string()).or_default();
            let state = entry.value_mut();
            state.window_ms = window_ms;
            let cutoff = now_ms.saturating_sub(window_ms);
            while state.stamps.front().is_some_and(|t| *t <= cutoff) {
                state.stamps.pop_front();
            }
            let count = state.stamps.len() as u64;
            let admitted = count < limit;
            if admitted {
                state.stamps.push_back(now_ms);
            }
            let reset_ms = state
                .stamps
                .front()
                .map(|oldest| (oldest + window_ms).saturating_sub(now_ms))
                .unwrap_or(window_ms);
            WindowCount {
                admitted,
                count: state.stamps.len() as u64,
                reset_ms,
            }
        };
        self.tick(now_ms);
        Ok(result)
    }

    async fn admit_fixed(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<WindowCount, QuotaStoreError> {
        let now = Instant::now();
        let result = {
            let mut entry = self.fixed.entry(key.to_string()).or_insert_with(|| Fixed {
                count: 0,
                started: now,
                window,
            });
            let state = entry.value_mut();
            if now.duration_since(state.started) >= state.window {
                state.count = 0;
                state.started = now;
                state.window = window;
            }
            state.count += 1;
            let elapsed = now.duration_since(state.started);
            WindowCount {
                admitted: state.count <= limit,
                count: state.count,
                reset_ms: state.window.saturating_sub(elapsed).as_millis() as u64,
            }
        };
        self.tick(chrono::Utc::now().timestamp_millis().max(0) as u64);
        Ok(result)
    }
}
