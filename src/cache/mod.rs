//! Object metadata cache
//!
//! A read-through snapshot of every object below the storage root, keyed by
//! decoded object key. The snapshot is loaded on first use and reloaded once
//! `ttl` has elapsed (never, when no TTL is configured). Writes made through
//! the gateway update a loaded snapshot in place; external changes to the
//! bucket are only seen after a reload.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::storage::ObjectMeta;
use crate::Result;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: None,
        }
    }
}

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Cache disabled or snapshot empty: ask the backend
    Unpopulated,
    Hit(ObjectMeta),
    Miss,
}

struct Snapshot {
    loaded_at: Instant,
    entries: HashMap<String, ObjectMeta>,
}

impl Snapshot {
    fn is_stale(&self, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| self.loaded_at.elapsed() >= ttl)
    }
}

/// Metadata cache shared by all operations of one gateway
pub struct EntryCache {
    config: CacheConfig,
    snapshot: RwLock<Option<Snapshot>>,
}

impl EntryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            snapshot: RwLock::new(None),
        }
    }

    pub fn disabled() -> Self {
        Self::new(CacheConfig {
            enabled: false,
            ttl: None,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Load the snapshot with `load` unless a fresh one is present.
    pub async fn ensure_loaded<F, Fut>(&self, load: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<ObjectMeta>>>,
    {
        if !self.config.enabled {
            return Ok(());
        }

        {
            let snapshot = self.snapshot.read().await;
            if matches!(&*snapshot, Some(s) if !s.is_stale(self.config.ttl)) {
                return Ok(());
            }
        }

        let mut snapshot = self.snapshot.write().await;
        if matches!(&*snapshot, Some(s) if !s.is_stale(self.config.ttl)) {
            return Ok(());
        }

        let objects = load().await?;
        tracing::debug!(entries = objects.len(), "Loaded object metadata snapshot");
        *snapshot = Some(Snapshot {
            loaded_at: Instant::now(),
            entries: objects
                .into_iter()
                .map(|meta| (meta.key.clone(), meta))
                .collect(),
        });
        Ok(())
    }

    pub async fn lookup(&self, key: &str) -> Lookup {
        let snapshot = self.snapshot.read().await;
        match &*snapshot {
            Some(s) if self.config.enabled && !s.entries.is_empty() => match s.entries.get(key) {
                Some(meta) => Lookup::Hit(meta.clone()),
                None => Lookup::Miss,
            },
            _ => Lookup::Unpopulated,
        }
    }

    /// Record a written object. Ignored until a snapshot is loaded.
    pub async fn upsert(&self, meta: ObjectMeta) {
        if let Some(s) = self.snapshot.write().await.as_mut() {
            s.entries.insert(meta.key.clone(), meta);
        }
    }

    pub async fn evict(&self, key: &str) {
        if let Some(s) = self.snapshot.write().await.as_mut() {
            s.entries.remove(key);
        }
    }

    /// Drop the snapshot so the next lookup reloads it
    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
    }

    pub async fn len(&self) -> usize {
        self.snapshot
            .read()
            .await
            .as_ref()
            .map_or(0, |s| s.entries.len())
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn meta(key: &str, size: u64) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size,
            e_tag: None,
            last_modified: None,
            content_type: None,
        }
    }

    async fn load(entries: Vec<ObjectMeta>) -> Result<Vec<ObjectMeta>> {
        Ok(entries)
    }

    async fn refuse() -> Result<Vec<ObjectMeta>> {
        Err(crate::Error::internal("disabled cache must not load"))
    }

    #[tokio::test]
    async fn test_lookup_before_and_after_load() {
        let cache = EntryCache::new(CacheConfig::default());
        assert_eq!(cache.lookup("a").await, Lookup::Unpopulated);

        cache
            .ensure_loaded(|| load(vec![meta("a", 3)]))
            .await
            .unwrap();
        assert_eq!(cache.lookup("a").await, Lookup::Hit(meta("a", 3)));
        assert_eq!(cache.lookup("b").await, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_loads_once_without_ttl() {
        let cache = EntryCache::new(CacheConfig::default());
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            cache
                .ensure_loaded(|| {
                    loads.fetch_add(1, Ordering::SeqCst);
                    load(vec![meta("a", 1)])
                })
                .await
                .unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reloads_after_ttl() {
        let cache = EntryCache::new(CacheConfig {
            enabled: true,
            ttl: Some(Duration::ZERO),
        });
        let loads = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .ensure_loaded(|| {
                    loads.fetch_add(1, Ordering::SeqCst);
                    load(vec![meta("a", 1)])
                })
                .await
                .unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_upsert_and_evict() {
        let cache = EntryCache::new(CacheConfig::default());

        // not loaded yet: upsert is ignored
        cache.upsert(meta("early", 1)).await;
        assert!(cache.is_empty().await);

        cache
            .ensure_loaded(|| load(vec![meta("a", 1)]))
            .await
            .unwrap();
        cache.upsert(meta("b", 2)).await;
        assert_eq!(cache.lookup("b").await, Lookup::Hit(meta("b", 2)));

        cache.evict("a").await;
        cache.evict("b").await;
        // an emptied snapshot no longer answers lookups
        assert_eq!(cache.lookup("a").await, Lookup::Unpopulated);
    }

    #[tokio::test]
    async fn test_disabled_cache_never_loads() {
        let cache = EntryCache::disabled();
        cache
            .ensure_loaded(refuse)
            .await
            .unwrap();
        assert_eq!(cache.lookup("a").await, Lookup::Unpopulated);
    }
}
