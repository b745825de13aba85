use std::collections::BTreeSet;

use impactgraph_core::{AliasKey, EntityId, Fact, GraphVersion};
use serde::{Deserialize, Serialize};

use crate::model::{ArtifactRecord, Edge, EdgeKey, Entity};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityChange {
    Upsert { entity: Entity, created: bool },
    /// Tombstone past its grace window. The last image is kept for audit.
    Reclaim(Entity),
}

impl EntityChange {
    pub fn entity(&self) -> &Entity {
        match self {
            EntityChange::Upsert { entity, .. } | EntityChange::Reclaim(entity) => entity,
        }
    }

    pub fn id(&self) -> EntityId {
        self.entity().id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeChange {
    Upsert { edge: Edge, created: bool },
    Remove(Edge),
}

impl EdgeChange {
    pub fn key(&self) -> EdgeKey {
        match self {
            EdgeChange::Upsert { edge, .. } | EdgeChange::Remove(edge) => edge.key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactChange {
    Upsert(ArtifactRecord),
    Remove(ArtifactRecord),
}

impl ArtifactChange {
    pub fn record(&self) -> &ArtifactRecord {
        match self {
            ArtifactChange::Upsert(record) | ArtifactChange::Remove(record) => record,
        }
    }
}

/// Full images of everything one transaction writes. Applied as a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteSet {
    pub entities: Vec<EntityChange>,
    pub edges: Vec<EdgeChange>,
    pub artifact: Option<ArtifactChange>,
}

impl WriteSet {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.edges.is_empty() && self.artifact.is_none()
    }

    /// Entity ids whose state this write set changes, edge endpoints included.
    pub fn footprint(&self) -> BTreeSet<EntityId> {
        let mut ids: BTreeSet<EntityId> = self.entities.iter().map(EntityChange::id).collect();
        for change in &self.edges {
            let key = change.key();
            ids.insert(key.source);
            ids.insert(key.target);
        }
        ids
    }

    pub fn artifact_path(&self) -> Option<&str> {
        self.artifact.as_ref().map(|a| a.record().path.as_str())
    }

    /// Assigns the committing version to every image.
    ///
    /// Lifecycle is derived here: an entity without occurrences is tombstoned
    /// at `version` (unless it already was), one with occurrences is live.
    pub fn stamp(&mut self, version: GraphVersion) {
        for change in &mut self.entities {
            if let EntityChange::Upsert { entity, created } = change {
                if *created {
                    entity.first_seen_version = version;
                }
                entity.last_version_seen = version;
                if entity.occurrences.is_empty() {
                    if entity.tombstoned_at.is_none() {
                        entity.tombstoned_at = Some(version);
                    }
                } else {
                    entity.tombstoned_at = None;
                }
            }
        }
        for change in &mut self.edges {
            if let EdgeChange::Upsert { edge, created } = change {
                if *created {
                    edge.first_seen_version = version;
                }
                edge.last_seen_version = version;
            }
        }
        if let Some(ArtifactChange::Upsert(record)) = &mut self.artifact {
            record.last_version = version;
        }
    }
}

/// What a transaction looked at; overlapping later commits force a retry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadSet {
    pub artifact: String,
    pub entities: BTreeSet<EntityId>,
    pub keys: BTreeSet<AliasKey>,
}

impl ReadSet {
    pub fn new(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            ..Default::default()
        }
    }

    pub fn overlaps(&self, write_set: &WriteSet, delta: &GraphDelta) -> bool {
        if write_set.artifact_path() == Some(self.artifact.as_str()) {
            return true;
        }
        if !self.keys.is_disjoint(&delta.touched_keys) {
            return true;
        }
        write_set
            .footprint()
            .iter()
            .any(|id| self.entities.contains(id))
    }
}

/// Summary of one committed update, consumed by cache invalidation and audit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDelta {
    pub version: GraphVersion,
    pub artifact: String,
    /// Entities whose content or incident edges changed.
    pub touched_entities: BTreeSet<EntityId>,
    /// Identity keys that now resolve differently.
    pub touched_keys: BTreeSet<AliasKey>,
    pub created: BTreeSet<EntityId>,
    pub tombstoned: BTreeSet<EntityId>,
    pub revived: BTreeSet<EntityId>,
    pub reclaimed: BTreeSet<EntityId>,
    pub added_edges: BTreeSet<EdgeKey>,
    pub removed_edges: BTreeSet<EdgeKey>,
    /// `(from, to)` pairs linked by a RENAMED_TO edge in this update.
    pub renames: Vec<(EntityId, EntityId)>,
}

impl GraphDelta {
    pub fn new(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            ..Default::default()
        }
    }

    pub fn touches(&self, id: &EntityId) -> bool {
        self.touched_entities.contains(id)
    }

    pub fn touches_key(&self, key: &AliasKey) -> bool {
        self.touched_keys.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.touched_entities.is_empty() && self.touched_keys.is_empty()
    }
}

/// A transaction ready for optimistic commit.
#[derive(Debug, Clone)]
pub struct PreparedTransaction {
    pub base_version: GraphVersion,
    pub artifact: String,
    pub revision: String,
    pub removed_facts: Vec<Fact>,
    pub added_facts: Vec<Fact>,
    pub write_set: WriteSet,
    pub reads: ReadSet,
    pub delta: GraphDelta,
}

#[cfg(test)]
mod tests {
    use super::*;
    use impactgraph_core::{CanonicalKey, EdgeKind, EntityKind, Location};

    use crate::model::Occurrence;

    fn entity(name: &str, occurs: bool) -> Entity {
        let mut e = Entity::new(
            EntityKind::ConfigKey,
            name,
            CanonicalKey::new(EntityKind::ConfigKey, name),
        );
        if occurs {
            e.occurrences.insert(Occurrence {
                artifact: "app.yml".into(),
                location: Location::line(1),
                raw_name: name.into(),
            });
        }
        e
    }

    #[test]
    fn stamp_derives_lifecycle_from_occurrences() {
        let mut ws = WriteSet {
            entities: vec![
                EntityChange::Upsert {
                    entity: entity("db.url", true),
                    created: true,
                },
                EntityChange::Upsert {
                    entity: entity("db.user", false),
                    created: false,
                },
            ],
            ..Default::default()
        };
        ws.stamp(GraphVersion(7));

        let live = ws.entities[0].entity();
        assert_eq!(live.first_seen_version, GraphVersion(7));
        assert!(live.is_live());

        let gone = ws.entities[1].entity();
        assert_eq!(gone.tombstoned_at, Some(GraphVersion(7)));
        assert_eq!(gone.first_seen_version, GraphVersion::ZERO);
    }

    #[test]
    fn read_set_overlap_on_shared_entities() {
        let a = entity("db.url", true);
        let b = entity("db.user", true);
        let edge = Edge::new(EdgeKey::new(a.id, EdgeKind::References, b.id));
        let ws = WriteSet {
            edges: vec![EdgeChange::Upsert {
                edge,
                created: true,
            }],
            ..Default::default()
        };

        let mut reads = ReadSet::new("other.yml");
        reads.entities.insert(b.id);
        assert!(reads.overlaps(&ws, &GraphDelta::default()));

        let disjoint = ReadSet::new("other.yml");
        assert!(!disjoint.overlaps(&ws, &GraphDelta::default()));
    }
}
