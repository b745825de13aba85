//! Arena-style graph snapshot: entities and edges live in id-keyed maps with
//! secondary indexes, never as owning references, so reference cycles are
//! just entries in two adjacency maps.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::sync::Arc;

use impactgraph_core::{
    AliasKey, CanonicalKey, EntityId, EntityKind, EntityRef, GraphVersion, ImpactGraphError,
    Result, TransformRegistry,
};
use serde::{Deserialize, Serialize};

use crate::model::{ArtifactRecord, Edge, EdgeKey, Entity};
use crate::resolve::{resolve_identity, IdentityIndex};
use crate::write_set::{ArtifactChange, EdgeChange, EntityChange, WriteSet};

#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    version: GraphVersion,
    entities: BTreeMap<EntityId, Arc<Entity>>,
    edges: BTreeMap<EdgeKey, Arc<Edge>>,
    artifacts: BTreeMap<String, Arc<ArtifactRecord>>,
    key_index: BTreeMap<CanonicalKey, EntityId>,
    alias_index: BTreeMap<AliasKey, BTreeSet<EntityId>>,
    outgoing: BTreeMap<EntityId, BTreeSet<EdgeKey>>,
    incoming: BTreeMap<EntityId, BTreeSet<EdgeKey>>,
    tombstones: BTreeSet<(GraphVersion, EntityId)>,
}

impl GraphSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn version(&self) -> GraphVersion {
        self.version
    }

    pub fn entity(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id).map(Arc::as_ref)
    }

    pub fn live_entity(&self, id: &EntityId) -> Option<&Entity> {
        self.entity(id).filter(|e| e.is_live())
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values().map(Arc::as_ref)
    }

    pub fn live_entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities().filter(|e| e.is_live())
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn live_entity_count(&self) -> usize {
        self.entities.len() - self.tombstones.len()
    }

    pub fn edge(&self, key: &EdgeKey) -> Option<&Edge> {
        self.edges.get(key).map(Arc::as_ref)
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values().map(Arc::as_ref)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Edges whose source is `id`, in key order.
    pub fn outgoing(&self, id: &EntityId) -> impl Iterator<Item = &Edge> {
        self.adjacent(&self.outgoing, id)
    }

    /// Edges whose target is `id`, in key order.
    pub fn incoming(&self, id: &EntityId) -> impl Iterator<Item = &Edge> {
        self.adjacent(&self.incoming, id)
    }

    fn adjacent<'a>(
        &'a self,
        index: &'a BTreeMap<EntityId, BTreeSet<EdgeKey>>,
        id: &EntityId,
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        index
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(move |key| self.edge(key))
    }

    pub fn degree(&self, id: &EntityId) -> usize {
        self.outgoing.get(id).map_or(0, BTreeSet::len) + self.incoming.get(id).map_or(0, BTreeSet::len)
    }

    pub fn artifact(&self, path: &str) -> Option<&ArtifactRecord> {
        self.artifacts.get(path).map(Arc::as_ref)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactRecord> {
        self.artifacts.values().map(Arc::as_ref)
    }

    /// Owner of a canonical key, tombstones included.
    pub fn lookup_key(&self, key: &CanonicalKey) -> Option<EntityId> {
        self.key_index.get(key).copied()
    }

    /// Live entities answering to `key`, any kind.
    pub fn lookup_alias(&self, key: &AliasKey) -> Vec<EntityId> {
        self.alias_index
            .get(key)
            .into_iter()
            .flatten()
            .filter(|id| self.live_entity(id).is_some())
            .copied()
            .collect()
    }

    /// Resolves a raw mention against this snapshot without creating anything.
    pub fn resolve(&self, registry: &TransformRegistry, entity: &EntityRef) -> Option<EntityId> {
        resolve_identity(self, registry, entity).id()
    }

    /// Tombstones stamped at or before `version`.
    pub fn tombstoned_before(&self, version: GraphVersion) -> Vec<EntityId> {
        self.tombstones
            .iter()
            .take_while(|(at, _)| *at <= version)
            .map(|(_, id)| *id)
            .collect()
    }

    /// Applies a stamped write set and moves the snapshot to `version`.
    pub fn apply(&mut self, version: GraphVersion, write_set: &WriteSet) -> Result<()> {
        if version <= self.version {
            return Err(ImpactGraphError::Integrity(format!(
                "write set for {} applied onto {}",
                version, self.version
            )));
        }

        for change in &write_set.entities {
            if let EntityChange::Upsert { entity, .. } = change {
                self.put_entity(entity.clone());
            }
        }
        for change in &write_set.edges {
            match change {
                EdgeChange::Upsert { edge, .. } => self.put_edge(edge.clone()),
                EdgeChange::Remove(edge) => self.drop_edge(&edge.key),
            }
        }
        for change in &write_set.entities {
            if let EntityChange::Reclaim(entity) = change {
                if self.degree(&entity.id) > 0 {
                    return Err(ImpactGraphError::Integrity(format!(
                        "reclaiming {} which still has edges",
                        entity
                    )));
                }
                self.drop_entity(&entity.id);
            }
        }
        match &write_set.artifact {
            Some(ArtifactChange::Upsert(record)) => {
                self.artifacts
                    .insert(record.path.clone(), Arc::new(record.clone()));
            }
            Some(ArtifactChange::Remove(record)) => {
                self.artifacts.remove(&record.path);
            }
            None => {}
        }
        self.version = version;
        Ok(())
    }

    fn put_entity(&mut self, entity: Entity) {
        self.drop_entity(&entity.id);
        let id = entity.id;
        self.key_index.insert(entity.canonical_key.clone(), id);
        for alias in &entity.alias_keys {
            self.alias_index.entry(alias.clone()).or_default().insert(id);
        }
        if let Some(at) = entity.tombstoned_at {
            self.tombstones.insert((at, id));
        }
        self.entities.insert(id, Arc::new(entity));
    }

    fn drop_entity(&mut self, id: &EntityId) {
        let Some(old) = self.entities.remove(id) else {
            return;
        };
        if self.key_index.get(&old.canonical_key) == Some(id) {
            self.key_index.remove(&old.canonical_key);
        }
        for alias in &old.alias_keys {
            if let Some(ids) = self.alias_index.get_mut(alias) {
                ids.remove(id);
                if ids.is_empty() {
                    self.alias_index.remove(alias);
                }
            }
        }
        if let Some(at) = old.tombstoned_at {
            self.tombstones.remove(&(at, *id));
        }
    }

    fn put_edge(&mut self, edge: Edge) {
        let key = edge.key;
        self.outgoing.entry(key.source).or_default().insert(key);
        self.incoming.entry(key.target).or_default().insert(key);
        self.edges.insert(key, Arc::new(edge));
    }

    fn drop_edge(&mut self, key: &EdgeKey) {
        self.edges.remove(key);
        for (index, endpoint) in [
            (&mut self.outgoing, key.source),
            (&mut self.incoming, key.target),
        ] {
            if let Some(keys) = index.get_mut(&endpoint) {
                keys.remove(key);
                if keys.is_empty() {
                    index.remove(&endpoint);
                }
            }
        }
    }

    /// Flat, index-free form used for checkpoints.
    pub fn to_image(&self) -> SnapshotImage {
        SnapshotImage {
            version: self.version,
            entities: self.entities().cloned().collect(),
            edges: self.edges().cloned().collect(),
            artifacts: self.artifacts().cloned().collect(),
        }
    }

    /// Rebuilds every index from a flat image.
    pub fn from_image(image: SnapshotImage) -> Self {
        let mut snapshot = GraphSnapshot {
            version: image.version,
            ..Default::default()
        };
        for entity in image.entities {
            snapshot.put_entity(entity);
        }
        for edge in image.edges {
            snapshot.put_edge(edge);
        }
        for record in image.artifacts {
            snapshot
                .artifacts
                .insert(record.path.clone(), Arc::new(record));
        }
        snapshot
    }

    /// Index entries that disagree with the primary maps.
    pub(crate) fn index_violations(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (key, id) in &self.key_index {
            match self.entities.get(id) {
                Some(e) if &e.canonical_key == key => {}
                _ => problems.push(format!("key index {} points at {}", key, id)),
            }
        }
        for (id, entity) in &self.entities {
            if self.key_index.get(&entity.canonical_key) != Some(id) {
                problems.push(format!("{} does not own its key {}", entity, entity.canonical_key));
            }
        }
        for (alias, ids) in &self.alias_index {
            for id in ids {
                if !self
                    .entities
                    .get(id)
                    .map(|e| e.alias_keys.contains(alias))
                    .unwrap_or(false)
                {
                    problems.push(format!("alias index {:?} points at {}", alias, id));
                }
            }
        }
        for (id, keys) in self.outgoing.iter().chain(self.incoming.iter()) {
            for key in keys {
                if !self.edges.contains_key(key) || key.other(*id).is_none() {
                    problems.push(format!("adjacency of {} lists missing edge {}", id, key));
                }
            }
        }
        for key in self.edges.keys() {
            let listed = self
                .outgoing
                .get(&key.source)
                .map(|k| k.contains(key))
                .unwrap_or(false)
                && self
                    .incoming
                    .get(&key.target)
                    .map(|k| k.contains(key))
                    .unwrap_or(false);
            if !listed {
                problems.push(format!("edge {} missing from adjacency", key));
            }
        }
        problems
    }

    #[cfg(test)]
    pub(crate) fn insert_raw_edge(&mut self, edge: Edge) {
        self.put_edge(edge);
    }
}

impl IdentityIndex for GraphSnapshot {
    fn by_key(&self, key: &CanonicalKey) -> Option<EntityId> {
        self.lookup_key(key)
    }

    fn by_alias(&self, alias: &AliasKey, kind: EntityKind) -> BTreeSet<EntityId> {
        self.lookup_alias(alias)
            .into_iter()
            .filter(|id| self.entity(id).map(|e| e.kind == kind).unwrap_or(false))
            .collect()
    }

    fn alias_keys_of(&self, id: EntityId) -> BTreeSet<AliasKey> {
        self.entity(&id)
            .map(|e| e.alias_keys.clone())
            .unwrap_or_default()
    }
}

/// Serializable snapshot without indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotImage {
    pub version: GraphVersion,
    pub entities: Vec<Entity>,
    pub edges: Vec<Edge>,
    pub artifacts: Vec<ArtifactRecord>,
}

/// Read handle pinned to one graph version. Cheap to clone; never observes
/// later writes.
#[derive(Debug, Clone)]
pub struct GraphHandle(Arc<GraphSnapshot>);

impl GraphHandle {
    pub fn new(snapshot: Arc<GraphSnapshot>) -> Self {
        Self(snapshot)
    }

    pub fn snapshot(&self) -> &Arc<GraphSnapshot> {
        &self.0
    }
}

impl Deref for GraphHandle {
    type Target = GraphSnapshot;

    fn deref(&self) -> &GraphSnapshot {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use impactgraph_core::{EdgeKind, Location};

    use crate::model::Occurrence;

    fn entity(registry: &TransformRegistry, kind: EntityKind, name: &str) -> Entity {
        let raw = EntityRef::new(kind, name);
        let mut e = Entity::new(kind, name, registry.canonical_key(&raw));
        e.alias_keys = registry.alias_keys(&raw).into_iter().collect();
        e.occurrences.insert(Occurrence {
            artifact: "src/UserService.java".into(),
            location: Location::line(1),
            raw_name: name.into(),
        });
        e
    }

    fn upsert(entity: Entity) -> EntityChange {
        EntityChange::Upsert {
            entity,
            created: true,
        }
    }

    #[test]
    fn apply_maintains_indexes() {
        let registry = TransformRegistry::default();
        let class = entity(&registry, EntityKind::Class, "UserService");
        let method = entity(&registry, EntityKind::Method, "UserService.findUserById");
        let key = EdgeKey::new(class.id, EdgeKind::Declares, method.id);

        let mut snapshot = GraphSnapshot::empty();
        let ws = WriteSet {
            entities: vec![upsert(class.clone()), upsert(method.clone())],
            edges: vec![EdgeChange::Upsert {
                edge: Edge::new(key),
                created: true,
            }],
            artifact: None,
        };
        snapshot.apply(GraphVersion(1), &ws).unwrap();

        assert_eq!(snapshot.version(), GraphVersion(1));
        assert_eq!(snapshot.outgoing(&class.id).count(), 1);
        assert_eq!(snapshot.incoming(&method.id).count(), 1);
        assert_eq!(
            snapshot.resolve(&registry, &EntityRef::new(EntityKind::Method, "findUserById")),
            Some(method.id)
        );
        assert!(snapshot.index_violations().is_empty());

        let removal = WriteSet {
            edges: vec![EdgeChange::Remove(Edge::new(key))],
            ..Default::default()
        };
        snapshot.apply(GraphVersion(2), &removal).unwrap();
        assert_eq!(snapshot.degree(&class.id), 0);
        assert!(snapshot.index_violations().is_empty());
    }

    #[test]
    fn stale_version_is_rejected() {
        let mut snapshot = GraphSnapshot::empty();
        snapshot.apply(GraphVersion(1), &WriteSet::default()).unwrap();
        assert!(matches!(
            snapshot.apply(GraphVersion(1), &WriteSet::default()),
            Err(ImpactGraphError::Integrity(_))
        ));
    }

    #[test]
    fn image_round_trip_rebuilds_indexes() {
        let registry = TransformRegistry::default();
        let key = entity(&registry, EntityKind::ConfigKey, "DATABASE_URL");
        let mut snapshot = GraphSnapshot::empty();
        snapshot
            .apply(
                GraphVersion(1),
                &WriteSet {
                    entities: vec![upsert(key.clone())],
                    ..Default::default()
                },
            )
            .unwrap();

        let rebuilt = GraphSnapshot::from_image(snapshot.to_image());
        assert_eq!(rebuilt.version(), GraphVersion(1));
        assert_eq!(
            rebuilt.resolve(&registry, &EntityRef::new(EntityKind::ConfigKey, "database.url")),
            Some(key.id)
        );
    }
}
