//! In-process TTL cache for funnel analysis results, backed by DashMap for
//! lock-free concurrent access. Injected into the analyzer explicitly; there
//! is no global cache.

use dashmap::DashMap;
use funnel_core::config::CacheConfig;
use funnel_core::types::{AnalysisOutput, GroupBy, Period};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Results are memoized per funnel, analysis window and grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub funnel_id: Uuid,
    pub period: Period,
    pub group_by: GroupBy,
}

impl CacheKey {
    pub fn new(funnel_id: Uuid, period: Period, group_by: GroupBy) -> Self {
        Self {
            funnel_id,
            period,
            group_by,
        }
    }
}

struct CacheEntry {
    output: AnalysisOutput,
    inserted_at: Instant,
}

/// TTL cache of analysis outputs.
///
/// Invalidation triggers: entries expire after the TTL, and
/// [`ResultCache::invalidate_funnel`] drops every entry of a funnel whose
/// definition or underlying events changed.
pub struct ResultCache {
    store: Arc<DashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl ResultCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            store: Arc::new(DashMap::new()),
            ttl,
            max_entries,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.max_entries)
    }

    /// Get a cached output, returns None if expired or missing.
    pub fn get(&self, key: &CacheKey) -> Option<AnalysisOutput> {
        let entry = self.store.get(key)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            drop(entry);
            if self.remove_if_expired(key) {
                metrics::counter!("funnel.cache.expired").increment(1);
            }
            return None;
        }
        Some(entry.output.clone())
    }

    /// Re-checks age under the shard lock, so an entry refreshed by a
    /// concurrent `put` survives.
    fn remove_if_expired(&self, key: &CacheKey) -> bool {
        self.store
            .remove_if(key, |_, e| e.inserted_at.elapsed() >= self.ttl)
            .is_some()
    }

    /// Insert or replace an output.
    pub fn put(&self, key: CacheKey, output: AnalysisOutput) {
        if self.store.len() >= self.max_entries && !self.store.contains_key(&key) {
            self.evict_expired();
            if self.store.len() >= self.max_entries {
                debug!(funnel_id = %key.funnel_id, "Result cache full, skipping insert");
                return;
            }
        }
        self.store.insert(
            key,
            CacheEntry {
                output,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop every cached result for `funnel_id`. Returns the number removed.
    pub fn invalidate_funnel(&self, funnel_id: &Uuid) -> usize {
        let before = self.store.len();
        self.store.retain(|key, _| key.funnel_id != *funnel_id);
        let removed = before - self.store.len();
        if removed > 0 {
            debug!(funnel_id = %funnel_id, removed, "Invalidated cached funnel results");
        }
        removed
    }

    /// Remove expired entries. Call this periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        self.store
            .retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
        before - self.store.len()
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}
