//! Project configuration cache
//!
//! A TTL cache of [`ProjectConfig`] snapshots keyed by project id, sitting in
//! front of the durable store on the execution path.
//!
//! - Expiry is lazy: an entry past its TTL is a miss on the next read and is
//!   dropped then. Nothing sweeps in the background, so memory is bounded by
//!   the number of projects rather than by request volume.
//! - Admin updates call [`ConfigCache::set`] after the store write commits.
//!   `set` is last-write-wins per key.
//! - Read-through fills go through [`ConfigCache::populate`], which never
//!   replaces a live entry carrying a newer `updated_at`. A fill that read the
//!   store just before an admin update therefore cannot clobber the refreshed
//!   copy.
//!
//! Each key lives in one `DashMap` shard, so a reader never sees a partially
//! written entry and writers to the same key are serialised.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::Clock;
use crate::models::ProjectConfig;

pub const DEFAULT_PROJECT_TTL: Duration = Duration::hours(24);

#[derive(Debug, Clone)]
struct CachedProject {
    config: ProjectConfig,
    expires_at: DateTime<Utc>,
}

impl CachedProject {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub inserts: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
}

pub struct ConfigCache {
    entries: DashMap<i64, CachedProject>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
}

impl ConfigCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            clock,
            stats: CacheStats::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached copy for `project_id`, or `None` on a miss or an expired entry.
    pub fn get(&self, project_id: i64) -> Option<ProjectConfig> {
        let now = self.clock.now();

        if let Some(entry) = self.entries.get(&project_id) {
            if !entry.is_expired(now) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.config.clone());
            }
        }

        // Re-check under the shard lock so a fresh concurrent `set` survives.
        if self
            .entries
            .remove_if(&project_id, |_, e| e.is_expired(now))
            .is_some()
        {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(project_id, "evicted expired project config");
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace unconditionally with an explicit TTL.
    pub fn set(&self, project_id: i64, config: ProjectConfig, ttl: Duration) {
        let expires_at = expiry(self.clock.now(), ttl);
        self.entries
            .insert(project_id, CachedProject { config, expires_at });
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// [`set`](Self::set) with the cache's configured TTL.
    pub fn refresh(&self, config: ProjectConfig) {
        self.set(config.id, config, self.ttl);
    }

    /// Read-through fill. Returns `false` when a live entry at least as new
    /// as `config` is already present and was kept.
    pub fn populate(&self, config: ProjectConfig) -> bool {
        let now = self.clock.now();
        let fresh = CachedProject {
            expires_at: expiry(now, self.ttl),
            config,
        };

        let inserted = match self.entries.entry(fresh.config.id) {
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                true
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.is_expired(now) || current.config.updated_at < fresh.config.updated_at {
                    slot.insert(fresh);
                    true
                } else {
                    false
                }
            }
        };

        if inserted {
            self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        }
        inserted
    }

    pub fn invalidate(&self, project_id: i64) {
        if self.entries.remove(&project_id).is_some() {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of entries currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}

// Saturates so an oversized TTL means "never expires" rather than a panic.
fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::NewProject;

    fn project(id: i64, model: &str, updated_at: DateTime<Utc>) -> ProjectConfig {
        let mut p = NewProject {
            name: format!("p{}", id),
            openai_token: "sk-test".into(),
            openai_base_url: None,
            openai_model: Some(model.into()),
        }
        .into_config(id, 1, updated_at);
        p.updated_at = updated_at;
        p
    }

    fn cache() -> (ConfigCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (ConfigCache::new(DEFAULT_PROJECT_TTL, clock.clone()), clock)
    }

    #[test]
    fn test_oversized_ttl_saturates_instead_of_overflowing() {
        let clock = Arc::new(ManualClock::default());
        let huge = Duration::try_days(1_000_000_000).unwrap();
        let cache = ConfigCache::new(huge, clock.clone());

        let first = project(1, "gpt-4o", clock.now());
        assert!(cache.populate(first.clone()));
        cache.set(2, project(2, "gpt-4o", clock.now()), huge);

        clock.advance(Duration::days(365 * 100));
        assert_eq!(cache.get(1), Some(first));
        assert!(cache.get(2).is_some());
    }

    #[test]
    fn test_set_then_get_within_ttl_is_hit() {
        let (cache, clock) = cache();
        let cfg = project(1, "gpt-4o", clock.now());
        cache.set(1, cfg.clone(), Duration::minutes(10));

        clock.advance(Duration::minutes(9));
        assert_eq!(cache.get(1), Some(cfg));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_get_after_ttl_is_miss_and_drops_entry() {
        let (cache, clock) = cache();
        cache.set(1, project(1, "gpt-4o", clock.now()), Duration::minutes(10));

        clock.advance(Duration::minutes(10));
        assert_eq!(cache.get(1), None);
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_default_ttl_is_one_day() {
        let (cache, clock) = cache();
        cache.refresh(project(3, "m", clock.now()));

        clock.advance(Duration::hours(24) - Duration::seconds(1));
        assert!(cache.get(3).is_some());
        clock.advance(Duration::seconds(1));
        assert!(cache.get(3).is_none());
    }

    #[test]
    fn test_last_set_wins() {
        let (cache, clock) = cache();
        let old = project(7, "old-model", clock.now());
        let new = project(7, "new-model", clock.now());

        cache.set(7, old, Duration::hours(1));
        cache.set(7, new.clone(), Duration::hours(1));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(7).unwrap().openai_model, "new-model");
    }

    #[test]
    fn test_populate_does_not_overwrite_newer_copy() {
        let (cache, clock) = cache();
        let t0 = clock.now();
        let stale = project(7, "old-model", t0);
        let updated = project(7, "new-model", t0 + Duration::seconds(1));

        cache.refresh(updated.clone());
        assert!(!cache.populate(stale));
        assert_eq!(cache.get(7), Some(updated));
    }

    #[test]
    fn test_populate_replaces_older_or_expired_copy() {
        let (cache, clock) = cache();
        let t0 = clock.now();

        assert!(cache.populate(project(2, "a", t0)));
        assert!(cache.populate(project(2, "b", t0 + Duration::seconds(5))));
        assert_eq!(cache.get(2).unwrap().openai_model, "b");

        clock.advance(Duration::days(2));
        assert!(cache.populate(project(2, "c", t0)));
        assert_eq!(cache.get(2).unwrap().openai_model, "c");
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let (cache, clock) = cache();
        cache.refresh(project(4, "m", clock.now()));
        cache.invalidate(4);
        assert!(cache.get(4).is_none());
        cache.invalidate(4);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_concurrent_access_keeps_one_entry_per_key() {
        let (cache, clock) = cache();
        let cache = Arc::new(cache);
        let base = clock.now();

        let mut handles = Vec::new();
        for i in 0..64i64 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let id = i % 4;
                cache.populate(project(id, &format!("m{}", i), base + Duration::seconds(i)));
                cache.get(id)
            }));
        }
        for result in futures::future::join_all(handles).await {
            assert!(result.unwrap().is_some());
        }

        assert_eq!(cache.len(), 4);
        // Highest updated_at per key survives: ids 60..63.
        for id in 0..4 {
            let model = cache.get(id).unwrap().openai_model;
            assert_eq!(model, format!("m{}", 60 + id));
        }
    }
}
