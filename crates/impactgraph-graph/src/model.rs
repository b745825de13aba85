use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use impactgraph_core::{
    AliasKey, CanonicalKey, Confidence, EdgeKind, EntityId, EntityKind, EntityRef, Fact,
    GraphVersion, Location, Provenance,
};
use serde::{Deserialize, Serialize};

/// One observation of an entity inside an artifact, under the raw name the
/// extractor used there.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Occurrence {
    pub artifact: String,
    pub location: Location,
    pub raw_name: String,
}

/// Artifact-independent concept tracked across all of its occurrences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Raw name of the first observation; kept across later merges.
    pub canonical_name: String,
    pub canonical_key: CanonicalKey,
    /// Scope-qualified keys this entity answers to (canonical key included).
    pub alias_keys: BTreeSet<AliasKey>,
    pub occurrences: BTreeSet<Occurrence>,
    pub first_seen_version: GraphVersion,
    pub last_version_seen: GraphVersion,
    pub tombstoned_at: Option<GraphVersion>,
}

impl Entity {
    pub fn new(kind: EntityKind, canonical_name: impl Into<String>, key: CanonicalKey) -> Self {
        Self {
            id: EntityId::new(),
            kind,
            canonical_name: canonical_name.into(),
            canonical_key: key,
            alias_keys: BTreeSet::new(),
            occurrences: BTreeSet::new(),
            first_seen_version: GraphVersion::ZERO,
            last_version_seen: GraphVersion::ZERO,
            tombstoned_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.tombstoned_at.is_none()
    }

    /// Naming-convention variants observed for this entity.
    pub fn alias_set(&self) -> BTreeSet<&str> {
        self.occurrences
            .iter()
            .map(|o| o.raw_name.as_str())
            .collect()
    }

    /// Artifact path and location per occurrence.
    pub fn provenance_set(&self) -> BTreeSet<(&str, Location)> {
        self.occurrences
            .iter()
            .map(|o| (o.artifact.as_str(), o.location))
            .collect()
    }

    pub fn artifacts(&self) -> BTreeSet<&str> {
        self.occurrences
            .iter()
            .map(|o| o.artifact.as_str())
            .collect()
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.canonical_name.clone())
    }

    /// Identity-relevant content, ignoring version stamps.
    pub fn same_content(&self, other: &Entity) -> bool {
        self.kind == other.kind
            && self.canonical_key == other.canonical_key
            && self.alias_keys == other.alias_keys
            && self.occurrences == other.occurrences
            && self.is_live() == other.is_live()
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.canonical_name, self.id)
    }
}

/// Edge identity. At most one edge exists per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    pub source: EntityId,
    pub kind: EdgeKind,
    pub target: EntityId,
}

impl EdgeKey {
    pub fn new(source: EntityId, kind: EdgeKind, target: EntityId) -> Self {
        Self {
            source,
            kind,
            target,
        }
    }

    /// The endpoint on the other side of `id`, if `id` is an endpoint.
    pub fn other(&self, id: EntityId) -> Option<EntityId> {
        if self.source == id {
            Some(self.target)
        } else if self.target == id {
            Some(self.source)
        } else {
            None
        }
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -{}-> {}", self.source, self.kind, self.target)
    }
}

/// One artifact's assertion of an edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeProvenance {
    pub provenance: Provenance,
    pub confidence: Confidence,
}

impl EdgeProvenance {
    pub fn artifact(&self) -> &str {
        &self.provenance.artifact
    }

    pub fn revision(&self) -> &str {
        &self.provenance.revision
    }

    /// Same assertion regardless of the revision it was stamped with.
    fn content(&self) -> (&str, Location, Confidence) {
        (
            &self.provenance.artifact,
            self.provenance.location,
            self.confidence,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub key: EdgeKey,
    pub provenance: BTreeSet<EdgeProvenance>,
    pub first_seen_version: GraphVersion,
    pub last_seen_version: GraphVersion,
}

impl Edge {
    pub fn new(key: EdgeKey) -> Self {
        Self {
            key,
            provenance: BTreeSet::new(),
            first_seen_version: GraphVersion::ZERO,
            last_seen_version: GraphVersion::ZERO,
        }
    }

    pub fn kind(&self) -> EdgeKind {
        self.key.kind
    }

    pub fn source(&self) -> EntityId {
        self.key.source
    }

    pub fn target(&self) -> EntityId {
        self.key.target
    }

    /// Effective confidence: the strongest assertion wins.
    pub fn confidence(&self) -> f64 {
        self.provenance
            .iter()
            .map(|p| p.confidence.value())
            .fold(0.0, f64::max)
    }

    pub fn asserted_by(&self, artifact: &str) -> bool {
        self.provenance.iter().any(|p| p.artifact() == artifact)
    }

    /// True when both edges carry the same assertions, revisions aside.
    pub fn same_assertions(&self, other: &Edge) -> bool {
        self.key == other.key
            && self
                .provenance
                .iter()
                .map(EdgeProvenance::content)
                .eq(other.provenance.iter().map(EdgeProvenance::content))
    }
}

/// What the store remembers about one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub path: String,
    pub revision: String,
    pub facts: BTreeSet<Fact>,
    /// How each raw mention of this artifact was resolved.
    #[serde(with = "pairs")]
    pub bindings: BTreeMap<EntityRef, EntityId>,
    pub last_version: GraphVersion,
}

impl ArtifactRecord {
    pub fn bound_entities(&self) -> BTreeSet<EntityId> {
        self.bindings.values().copied().collect()
    }
}

/// Serializes maps with structured keys as a list of pairs, which both JSON
/// and bincode accept.
pub(crate) mod pairs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S, K, V>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        K: Serialize,
        V: Serialize,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D, K, V>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        D: Deserializer<'de>,
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
    {
        let pairs: Vec<(K, V)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}
