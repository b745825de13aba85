use std::collections::{BTreeSet, HashMap, HashSet};

use impactgraph_core::{AliasKey, EntityId, GraphVersion};
use impactgraph_graph::GraphDelta;
use serde::{Deserialize, Serialize};

use crate::cache::CacheKey;

/// Graph state a cached value was derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDependencies {
    /// Every entity visited while computing the value.
    pub entities: BTreeSet<EntityId>,
    /// Identity keys probed while inferring seeds; a new entity answering to
    /// one of them changes the result even though it was never visited.
    pub keys: BTreeSet<AliasKey>,
}

impl CacheDependencies {
    pub fn new(entities: BTreeSet<EntityId>, keys: BTreeSet<AliasKey>) -> Self {
        Self { entities, keys }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.keys.is_empty()
    }

    pub fn touched_by(&self, delta: &GraphDelta) -> bool {
        self.entities.iter().any(|id| delta.touches(id))
            || self.keys.iter().any(|k| delta.touches_key(k))
    }
}

/// Reverse index from dependencies to cache keys, plus the last version that
/// touched each dependency.
///
/// The watermarks let a put computed against an older version be refused
/// once an invalidation for a newer version has already run. Marks at or
/// below `floor` are pruned; a put older than the floor is refused outright.
#[derive(Debug, Default)]
pub(crate) struct DependencyIndex {
    by_entity: HashMap<EntityId, HashSet<CacheKey>>,
    by_key: HashMap<AliasKey, HashSet<CacheKey>>,
    entity_marks: HashMap<EntityId, GraphVersion>,
    key_marks: HashMap<AliasKey, GraphVersion>,
    floor: GraphVersion,
    latest: GraphVersion,
}

impl DependencyIndex {
    pub(crate) fn register(&mut self, key: &CacheKey, deps: &CacheDependencies) {
        for id in &deps.entities {
            self.by_entity.entry(*id).or_default().insert(key.clone());
        }
        for alias in &deps.keys {
            self.by_key.entry(alias.clone()).or_default().insert(key.clone());
        }
    }

    pub(crate) fn unregister(&mut self, key: &CacheKey, deps: &CacheDependencies) {
        for id in &deps.entities {
            if let Some(keys) = self.by_entity.get_mut(id) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_entity.remove(id);
                }
            }
        }
        for alias in &deps.keys {
            if let Some(keys) = self.by_key.get_mut(alias) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_key.remove(alias);
                }
            }
        }
    }

    /// True when a dependency changed after `version`.
    pub(crate) fn is_stale(&self, deps: &CacheDependencies, version: GraphVersion) -> bool {
        if version < self.floor {
            return true;
        }
        deps.entities
            .iter()
            .filter_map(|id| self.entity_marks.get(id))
            .chain(deps.keys.iter().filter_map(|k| self.key_marks.get(k)))
            .any(|mark| *mark > version)
    }

    /// Advances watermarks and returns the cache keys depending on anything
    /// the delta touched.
    pub(crate) fn mark(&mut self, delta: &GraphDelta) -> HashSet<CacheKey> {
        let mut hit = HashSet::new();
        self.latest = self.latest.max(delta.version);
        for id in &delta.touched_entities {
            let mark = self.entity_marks.entry(*id).or_default();
            *mark = (*mark).max(delta.version);
            if let Some(keys) = self.by_entity.get(id) {
                hit.extend(keys.iter().cloned());
            }
        }
        for alias in &delta.touched_keys {
            let mark = self.key_marks.entry(alias.clone()).or_default();
            *mark = (*mark).max(delta.version);
            if let Some(keys) = self.by_key.get(alias) {
                hit.extend(keys.iter().cloned());
            }
        }
        hit
    }

    /// Forgets marks no entry at or after `oldest` can be affected by.
    pub(crate) fn prune(&mut self, oldest: GraphVersion) {
        if oldest <= self.floor {
            return;
        }
        self.entity_marks.retain(|_, mark| *mark > oldest);
        self.key_marks.retain(|_, mark| *mark > oldest);
        self.floor = oldest;
    }

    pub(crate) fn mark_count(&self) -> usize {
        self.entity_marks.len() + self.key_marks.len()
    }

    pub(crate) fn clear(&mut self) {
        self.by_entity.clear();
        self.by_key.clear();
        self.entity_marks.clear();
        self.key_marks.clear();
        self.floor = self.latest;
    }
}
