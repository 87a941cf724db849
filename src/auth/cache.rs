use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Identity;

/// Prune expired entries every this many inserts.
const PRUNE_EVERY: u64 = 256;

struct CachedIdentity {
    identity: Arc<Identity>,
    expires_at: Instant,
}

/// Short-lived map from credential hash to resolved identity.  Entries are
/// immutable; an expired entry behaves exactly like a missing one.
pub struct IdentityCache {
    entries: DashMap<String, CachedIdentity>,
    ttl: Duration,
    inserts: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl IdentityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            inserts: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Identity>> {
        let now = Instant::now();
        let found = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.identity.clone()),
            Some(_) => None,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        match found {
            Some(identity) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(identity)
            }
            None => {
                // Stale: drop it unless someone refreshed it meanwhile.
                self.entries.remove_if(key, |_, v| v.expires_at <= now);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: String, identity: Arc<Identity>) {
        self.entries.insert(
            key,
            CachedIdentity {
                identity,
                expires_at: Instant::now() + self.ttl,
            },
        );
        let n = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if n % PRUNE_EVERY == 0 {
            self.prune();
        }
    }

    /// Drop a single entry, e.g. after the backing credential was revoked.
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn prune(&self) {
        let now = Instant::now();
        self.entries.retain(|_, v| v.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
