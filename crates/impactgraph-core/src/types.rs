use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{ImpactGraphError, Result};

/// Stable, opaque entity identity. Never reassigned across renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = ImpactGraphError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(EntityId)
            .map_err(|e| ImpactGraphError::validation(format!("invalid entity id '{}': {}", s, e)))
    }
}

/// Monotonic graph version, bumped once per committed update batch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GraphVersion(pub u64);

impl GraphVersion {
    pub const ZERO: GraphVersion = GraphVersion(0);

    pub fn next(self) -> Self {
        GraphVersion(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GraphVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Naming-convention scope. Alias uniqueness only holds inside one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingScope {
    Code,
    Config,
    Prose,
    Tracker,
}

impl NamingScope {
    pub const ALL: [NamingScope; 4] = [
        NamingScope::Code,
        NamingScope::Config,
        NamingScope::Prose,
        NamingScope::Tracker,
    ];
}

impl fmt::Display for NamingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NamingScope::Code => "code",
            NamingScope::Config => "config",
            NamingScope::Prose => "prose",
            NamingScope::Tracker => "tracker",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Class,
    Interface,
    Method,
    Function,
    Field,
    Module,
    ConfigKey,
    Endpoint,
    Document,
    Section,
    TestCase,
    TestFixture,
    Issue,
    Milestone,
    Project,
}

impl EntityKind {
    pub const ALL: [EntityKind; 15] = [
        EntityKind::Class,
        EntityKind::Interface,
        EntityKind::Method,
        EntityKind::Function,
        EntityKind::Field,
        EntityKind::Module,
        EntityKind::ConfigKey,
        EntityKind::Endpoint,
        EntityKind::Document,
        EntityKind::Section,
        EntityKind::TestCase,
        EntityKind::TestFixture,
        EntityKind::Issue,
        EntityKind::Milestone,
        EntityKind::Project,
    ];

    pub fn scope(self) -> NamingScope {
        match self {
            EntityKind::Class
            | EntityKind::Interface
            | EntityKind::Method
            | EntityKind::Function
            | EntityKind::Field
            | EntityKind::Module
            | EntityKind::Endpoint
            | EntityKind::TestCase
            | EntityKind::TestFixture => NamingScope::Code,
            EntityKind::ConfigKey => NamingScope::Config,
            EntityKind::Document | EntityKind::Section => NamingScope::Prose,
            EntityKind::Issue | EntityKind::Milestone | EntityKind::Project => {
                NamingScope::Tracker
            }
        }
    }

    pub fn kinds_in_scope(scope: NamingScope) -> impl Iterator<Item = EntityKind> {
        Self::ALL.into_iter().filter(move |k| k.scope() == scope)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Class => "class",
            EntityKind::Interface => "interface",
            EntityKind::Method => "method",
            EntityKind::Function => "function",
            EntityKind::Field => "field",
            EntityKind::Module => "module",
            EntityKind::ConfigKey => "config_key",
            EntityKind::Endpoint => "endpoint",
            EntityKind::Document => "document",
            EntityKind::Section => "section",
            EntityKind::TestCase => "test_case",
            EntityKind::TestFixture => "test_fixture",
            EntityKind::Issue => "issue",
            EntityKind::Milestone => "milestone",
            EntityKind::Project => "project",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ImpactGraphError;

    fn from_str(s: &str) -> Result<Self> {
        let folded: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str().replace('_', "") == folded)
            .ok_or_else(|| ImpactGraphError::validation(format!("unknown entity kind '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    Declares,
    References,
    Overrides,
    Documents,
    Tests,
    RenamedTo,
}

impl EdgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeKind::Declares => "DECLARES",
            EdgeKind::References => "REFERENCES",
            EdgeKind::Overrides => "OVERRIDES",
            EdgeKind::Documents => "DOCUMENTS",
            EdgeKind::Tests => "TESTS",
            EdgeKind::RenamedTo => "RENAMED_TO",
        }
    }

    /// Edges whose source structurally depends on the target symbol.
    pub fn is_structural(self) -> bool {
        matches!(self, EdgeKind::References | EdgeKind::Overrides)
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EdgeKind {
    type Err = ImpactGraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "DECLARES" => Ok(EdgeKind::Declares),
            "REFERENCES" => Ok(EdgeKind::References),
            "OVERRIDES" => Ok(EdgeKind::Overrides),
            "DOCUMENTS" => Ok(EdgeKind::Documents),
            "TESTS" => Ok(EdgeKind::Tests),
            "RENAMED_TO" => Ok(EdgeKind::RenamedTo),
            other => Err(ImpactGraphError::validation(format!(
                "unknown edge kind '{}'",
                other
            ))),
        }
    }
}

/// Proposed mutation for impact analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Rename,
    Delete,
    ValueChange,
    SignatureChange,
}

impl MutationKind {
    /// Whether a dependent reached directly over `edge` is broken by this mutation.
    pub fn invalidates(self, edge: EdgeKind) -> bool {
        match (self, edge) {
            (MutationKind::ValueChange, EdgeKind::Overrides) => false,
            (_, kind) => kind.is_structural(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::Rename => "rename",
            MutationKind::Delete => "delete",
            MutationKind::ValueChange => "value_change",
            MutationKind::SignatureChange => "signature_change",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = ImpactGraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "rename" => Ok(MutationKind::Rename),
            "delete" => Ok(MutationKind::Delete),
            "value_change" => Ok(MutationKind::ValueChange),
            "signature_change" => Ok(MutationKind::SignatureChange),
            other => Err(ImpactGraphError::validation(format!(
                "unknown mutation kind '{}'",
                other
            ))),
        }
    }
}

/// Extractor confidence in `[0, 1]`, totally ordered so facts can live in sets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Confidence(f64);

impl Confidence {
    pub const CERTAIN: Confidence = Confidence(1.0);

    pub fn new(value: f64) -> Result<Self> {
        if value.is_nan() || !(0.0..=1.0).contains(&value) {
            return Err(ImpactGraphError::validation(format!(
                "confidence {} outside [0, 1]",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        !self.0.is_nan() && (0.0..=1.0).contains(&self.0)
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Self::CERTAIN
    }
}

impl PartialEq for Confidence {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Confidence {}

impl PartialOrd for Confidence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Confidence {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl std::hash::Hash for Confidence {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Location {
    pub line: u32,
    #[serde(default)]
    pub column: Option<u32>,
}

impl Location {
    pub fn line(line: u32) -> Self {
        Self { line, column: None }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(col) => write!(f, "{}:{}", self.line, col),
            None => write!(f, "{}", self.line),
        }
    }
}

/// Where an entity or edge was observed: artifact path, artifact revision, location.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub artifact: String,
    pub revision: String,
    pub location: Location,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.artifact, self.location)
    }
}

/// Raw entity mention as emitted by an extractor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub name: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// Normalized fact record produced by a per-filetype extractor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fact {
    /// The entity occurs (is declared or mentioned) in the artifact.
    Declares { entity: EntityRef, location: Location },
    /// A typed relationship between two entities observed in the artifact.
    Relates {
        kind: EdgeKind,
        source: EntityRef,
        target: EntityRef,
        location: Location,
        #[serde(default)]
        confidence: Confidence,
    },
}

impl Fact {
    pub fn declares(kind: EntityKind, name: impl Into<String>, line: u32) -> Self {
        Fact::Declares {
            entity: EntityRef::new(kind, name),
            location: Location::line(line),
        }
    }

    pub fn relates(kind: EdgeKind, source: EntityRef, target: EntityRef, line: u32) -> Self {
        Fact::Relates {
            kind,
            source,
            target,
            location: Location::line(line),
            confidence: Confidence::CERTAIN,
        }
    }

    pub fn with_confidence(self, value: f64) -> Result<Self> {
        match self {
            Fact::Relates {
                kind,
                source,
                target,
                location,
                ..
            } => Ok(Fact::Relates {
                kind,
                source,
                target,
                location,
                confidence: Confidence::new(value)?,
            }),
            declares => Ok(declares),
        }
    }

    pub fn location(&self) -> Location {
        match self {
            Fact::Declares { location, .. } | Fact::Relates { location, .. } => *location,
        }
    }

    /// Entities mentioned by this fact.
    pub fn entities(&self) -> Vec<&EntityRef> {
        match self {
            Fact::Declares { entity, .. } => vec![entity],
            Fact::Relates { source, target, .. } => vec![source, target],
        }
    }

    pub fn validate(&self) -> Result<()> {
        for entity in self.entities() {
            if entity.name.trim().is_empty() {
                return Err(ImpactGraphError::validation(format!(
                    "empty {} name in fact at line {}",
                    entity.kind,
                    self.location()
                )));
            }
        }
        if let Fact::Relates {
            kind,
            source,
            target,
            confidence,
            ..
        } = self
        {
            if *kind == EdgeKind::RenamedTo {
                return Err(ImpactGraphError::validation(
                    "RENAMED_TO edges are derived by the updater, not extracted",
                ));
            }
            if !confidence.is_valid() {
                return Err(ImpactGraphError::validation(format!(
                    "confidence {} outside [0, 1]",
                    confidence.value()
                )));
            }
            if source == target {
                return Err(ImpactGraphError::validation(format!(
                    "self relation {} on {}",
                    kind, source
                )));
            }
        }
        Ok(())
    }
}

/// Stable digest of an artifact's fact set, used as revision when no content hash is supplied.
pub fn fact_digest<'a>(facts: impl IntoIterator<Item = &'a Fact>) -> String {
    let ordered: BTreeSet<&Fact> = facts.into_iter().collect();
    let mut hasher = Sha256::new();
    for fact in ordered {
        match serde_json::to_vec(fact) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(format!("{:?}", fact).as_bytes()),
        }
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Ingestion boundary: full fact set of one artifact revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactChangeEvent {
    pub path: String,
    pub content_hash: String,
    #[serde(default)]
    pub extracted_facts: Vec<Fact>,
}

impl ArtifactChangeEvent {
    pub fn new(path: impl Into<String>, content_hash: impl Into<String>, facts: Vec<Fact>) -> Self {
        Self {
            path: path.into(),
            content_hash: content_hash.into(),
            extracted_facts: facts,
        }
    }

    /// An event without facts retracts the artifact.
    pub fn is_retraction(&self) -> bool {
        self.extracted_facts.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(ImpactGraphError::validation("change event without artifact path"));
        }
        if self.content_hash.trim().is_empty() {
            return Err(ImpactGraphError::validation(format!(
                "change event for '{}' without content hash",
                self.path
            )));
        }
        let mut seen = BTreeSet::new();
        for fact in &self.extracted_facts {
            fact.validate()?;
            if !seen.insert(fact) {
                return Err(ImpactGraphError::validation(format!(
                    "duplicate fact in '{}': {:?}",
                    self.path, fact
                )));
            }
        }
        Ok(())
    }
}

/// One artifact's changeset as consumed by the incremental updater.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactChangeset {
    pub path: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub removed: Vec<Fact>,
    #[serde(default)]
    pub added: Vec<Fact>,
}

impl ArtifactChangeset {
    pub fn new(path: impl Into<String>, removed: Vec<Fact>, added: Vec<Fact>) -> Self {
        Self {
            path: path.into(),
            content_hash: None,
            removed,
            added,
        }
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// The exact inverse: re-asserts what was removed and retracts what was added.
    pub fn inverse(&self) -> Self {
        Self {
            path: self.path.clone(),
            content_hash: None,
            removed: self.added.clone(),
            added: self.removed.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(ImpactGraphError::validation("changeset without artifact path"));
        }
        if let Some(hash) = &self.content_hash {
            if hash.trim().is_empty() {
                return Err(ImpactGraphError::validation(format!(
                    "changeset for '{}' has an empty content hash",
                    self.path
                )));
            }
        }
        let mut removed = BTreeSet::new();
        for fact in &self.removed {
            fact.validate()?;
            if !removed.insert(fact) {
                return Err(ImpactGraphError::validation(format!(
                    "fact removed twice in '{}'",
                    self.path
                )));
            }
        }
        let mut added = BTreeSet::new();
        for fact in &self.added {
            fact.validate()?;
            if !added.insert(fact) {
                return Err(ImpactGraphError::validation(format!(
                    "fact added twice in '{}'",
                    self.path
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_parsing_accepts_variants() {
        assert_eq!("ConfigKey".parse::<EntityKind>().unwrap(), EntityKind::ConfigKey);
        assert_eq!("config_key".parse::<EntityKind>().unwrap(), EntityKind::ConfigKey);
        assert_eq!("test-case".parse::<EntityKind>().unwrap(), EntityKind::TestCase);
        assert!("widget".parse::<EntityKind>().is_err());
    }

    #[test]
    fn value_change_does_not_invalidate_overrides() {
        assert!(MutationKind::ValueChange.invalidates(EdgeKind::References));
        assert!(!MutationKind::ValueChange.invalidates(EdgeKind::Overrides));
        assert!(MutationKind::Rename.invalidates(EdgeKind::Overrides));
        assert!(!MutationKind::Delete.invalidates(EdgeKind::Documents));
    }

    #[test]
    fn confidence_out_of_range_is_rejected() {
        assert!(Confidence::new(1.2).is_err());
        assert!(Confidence::new(f64::NAN).is_err());
        assert!(Confidence::new(0.0).is_ok());
    }

    #[test]
    fn fact_validation_rejects_self_relations_and_renames() {
        let a = EntityRef::new(EntityKind::Method, "save");
        let self_ref = Fact::relates(EdgeKind::References, a.clone(), a.clone(), 3);
        assert!(self_ref.validate().is_err());

        let b = EntityRef::new(EntityKind::Method, "store");
        let rename = Fact::relates(EdgeKind::RenamedTo, a, b, 3);
        assert!(rename.validate().is_err());
    }

    #[test]
    fn fact_digest_is_order_independent() {
        let f1 = Fact::declares(EntityKind::Class, "UserService", 1);
        let f2 = Fact::declares(EntityKind::Method, "UserService.save", 4);
        assert_eq!(fact_digest([&f1, &f2]), fact_digest([&f2, &f1]));
        assert_ne!(fact_digest([&f1]), fact_digest([&f2]));
    }

    #[test]
    fn change_event_validation() {
        let ok = ArtifactChangeEvent::new(
            "src/UserService.java",
            "abc",
            vec![Fact::declares(EntityKind::Class, "UserService", 1)],
        );
        assert!(ok.validate().is_ok());

        let no_hash = ArtifactChangeEvent::new("src/UserService.java", " ", vec![]);
        assert!(matches!(
            no_hash.validate(),
            Err(ImpactGraphError::Validation(_))
        ));

        let dup = ArtifactChangeEvent::new(
            "a.md",
            "h",
            vec![
                Fact::declares(EntityKind::Document, "a.md", 1),
                Fact::declares(EntityKind::Document, "a.md", 1),
            ],
        );
        assert!(dup.validate().is_err());
    }

    #[test]
    fn changeset_inverse_swaps_sides() {
        let f = Fact::declares(EntityKind::ConfigKey, "db.url", 2);
        let cs = ArtifactChangeset::new("app.yml", vec![], vec![f.clone()]).with_content_hash("x");
        let inv = cs.inverse();
        assert_eq!(inv.removed, vec![f]);
        assert!(inv.added.is_empty());
        assert!(inv.content_hash.is_none());
    }
}
