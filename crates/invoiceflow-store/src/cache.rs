//! Hot cache of the latest checkpoint per instance, backed by [`moka`].
//!
//! Only the checkpoint writer populates the cache, and it does so while
//! holding the instance's write lock, so a cached entry is never older than
//! what this process last committed. Reads that miss fall through to SQLite
//! without back-filling.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use tracing::debug;

use crate::checkpoint::StoredCheckpoint;

// ── cache stats ──────────────────────────────────────────────────────

/// Counters tracking cache effectiveness.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit rate as a value between 0.0 and 1.0 (returns 0.0 if no lookups).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.hit_rate() * 100.0,
        )
    }
}

// ── snapshot cache ───────────────────────────────────────────────────

/// Latest [`StoredCheckpoint`] per instance id.
#[derive(Clone)]
pub struct SnapshotCache {
    inner: Cache<String, StoredCheckpoint>,
    stats: Arc<CacheStats>,
}

impl SnapshotCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        debug!(max_capacity, ttl_secs = ttl.as_secs(), "snapshot cache created");
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub async fn get(&self, instance_id: &str) -> Option<StoredCheckpoint> {
        match self.inner.get(instance_id).await {
            Some(snapshot) => {
                self.stats.record_hit();
                Some(snapshot)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Replace the cached snapshot unless the cached one is already newer.
    pub async fn offer(&self, snapshot: StoredCheckpoint) {
        if let Some(current) = self.inner.get(&snapshot.instance_id).await {
            if current.version >= snapshot.version {
                return;
            }
        }
        self.inner
            .insert(snapshot.instance_id.clone(), snapshot)
            .await;
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(300))
    }
}

// ── tests ────────────────────────────────────────────────────────────
