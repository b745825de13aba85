use std::num::NonZeroUsize;

use impactgraph_core::{CacheSettings, EntityId, GraphVersion, MutationKind};
use impactgraph_graph::{CommitObserver, GraphDelta};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::invalidation::{CacheDependencies, DependencyIndex};
use crate::metrics::CacheStats;

/// Cache key types for the two cached query results
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheKey {
    /// Context bundle by query signature (hex digest).
    Bundle(String),
    /// Impact report for one root and mutation.
    Impact {
        entity: EntityId,
        mutation: MutationKind,
    },
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    /// Version the value was computed against.
    pub version: GraphVersion,
    pub deps: CacheDependencies,
    pub access_count: u64,
}

struct CacheState<V> {
    entries: LruCache<CacheKey, CacheEntry<V>>,
    index: DependencyIndex,
    stats: CacheStats,
}

impl<V> CacheState<V> {
    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let entry = self.entries.pop(key)?;
        self.index.unregister(key, &entry.deps);
        Some(entry)
    }
}

/// Bounded LRU cache of query results keyed by graph version.
///
/// An entry computed at version `v` stays valid for every later version
/// until a delta touches one of its dependencies. Lookups, puts and
/// invalidations serialize on one lock, and a put computed against a version
/// older than an already-applied invalidation of its dependencies is
/// refused, so invalidation always wins a race with a concurrent write.
pub struct QueryCache<V> {
    state: Mutex<CacheState<V>>,
    enable_metrics: bool,
}

impl<V: Clone> QueryCache<V> {
    pub fn new(settings: &CacheSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                index: DependencyIndex::default(),
                stats: CacheStats::default(),
            }),
            enable_metrics: settings.enable_metrics,
        }
    }

    /// Value for `key` as seen by a reader pinned at `version`.
    pub fn get(&self, key: &CacheKey, version: GraphVersion) -> Option<V> {
        let mut state = self.state.lock();
        let fresh = match state.entries.peek(key) {
            None => None,
            Some(entry) if entry.version > version => Some(false),
            Some(entry) => Some(!state.index.is_stale(&entry.deps, entry.version)),
        };

        let value = match fresh {
            // A hit proves the entry valid at the reader's version as well.
            Some(true) => state.entries.get_mut(key).map(|entry| {
                entry.access_count += 1;
                entry.version = entry.version.max(version);
                entry.value.clone()
            }),
            Some(false) => {
                if state
                    .entries
                    .peek(key)
                    .map_or(false, |e| e.version <= version)
                {
                    state.remove(key);
                }
                None
            }
            None => None,
        };

        if self.enable_metrics {
            match value {
                Some(_) => state.stats.hits += 1,
                None => state.stats.misses += 1,
            }
        }
        trace!(?key, %version, hit = value.is_some(), "Cache lookup");
        value
    }

    /// Stores a value computed against `version`. Returns false when the
    /// value is already stale.
    pub fn put(
        &self,
        key: CacheKey,
        version: GraphVersion,
        value: V,
        deps: CacheDependencies,
    ) -> bool {
        let mut state = self.state.lock();
        if state.index.is_stale(&deps, version) {
            if self.enable_metrics {
                state.stats.rejected_puts += 1;
            }
            debug!(?key, %version, "Refusing stale cache write");
            return false;
        }

        state.remove(&key);
        state.index.register(&key, &deps);
        let entry = CacheEntry {
            value,
            version,
            deps,
            access_count: 0,
        };
        if let Some((evicted, old)) = state.entries.push(key, entry) {
            state.index.unregister(&evicted, &old.deps);
            if self.enable_metrics {
                state.stats.evictions += 1;
            }
        }
        if self.enable_metrics {
            state.stats.insertions += 1;
        }
        true
    }

    /// Drops every entry depending on something `delta` touched. Returns the
    /// number of entries removed.
    pub fn invalidate(&self, delta: &GraphDelta) -> usize {
        let mut state = self.state.lock();
        let keys = state.index.mark(delta);
        let mut removed = 0;
        for key in &keys {
            if state.remove(key).is_some() {
                removed += 1;
            }
        }
        let oldest = state
            .entries
            .iter()
            .map(|(_, entry)| entry.version)
            .min()
            .unwrap_or(delta.version);
        state.index.prune(oldest);
        if self.enable_metrics {
            state.stats.invalidations += removed as u64;
        }
        if removed > 0 {
            debug!(version = %delta.version, removed, "Cache entries invalidated");
        }
        removed
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.state.lock().remove(key).is_some()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains(key)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.index.clear();
    }

    /// Invalidation watermarks currently retained.
    pub fn tracked_marks(&self) -> usize {
        self.state.lock().index.mark_count()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            ..state.stats.clone()
        }
    }
}

impl<V: Clone + Send> CommitObserver for QueryCache<V> {
    fn on_commit(&self, delta: &GraphDelta) {
        self.invalidate(delta);
    }

    fn on_reset(&self) {
        self.clear();
    }
}
