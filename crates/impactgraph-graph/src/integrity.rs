use std::collections::BTreeSet;
use std::fmt;

use impactgraph_core::{EdgeKind, EntityId, GraphVersion};
use serde::{Deserialize, Serialize};

use crate::model::{Edge, EdgeKey};
use crate::snapshot::GraphSnapshot;
use crate::write_set::WriteSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum IntegrityViolation {
    MissingEndpoint { edge: EdgeKey, entity: EntityId },
    TombstonedEndpoint { edge: EdgeKey, entity: EntityId },
    EmptyProvenance { edge: EdgeKey },
    StaleProvenance { edge: EdgeKey, artifact: String, revision: String },
    LiveWithoutOccurrences { entity: EntityId },
    TombstoneWithOccurrences { entity: EntityId },
    UnknownArtifact { entity: EntityId, artifact: String },
    Index { detail: String },
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityViolation::MissingEndpoint { edge, entity } => {
                write!(f, "edge {} references missing entity {}", edge, entity)
            }
            IntegrityViolation::TombstonedEndpoint { edge, entity } => {
                write!(f, "edge {} references tombstoned entity {}", edge, entity)
            }
            IntegrityViolation::EmptyProvenance { edge } => {
                write!(f, "edge {} has no provenance", edge)
            }
            IntegrityViolation::StaleProvenance {
                edge,
                artifact,
                revision,
            } => write!(
                f,
                "edge {} cites {}@{} which is not a live revision",
                edge, artifact, revision
            ),
            IntegrityViolation::LiveWithoutOccurrences { entity } => {
                write!(f, "live entity {} has no occurrences", entity)
            }
            IntegrityViolation::TombstoneWithOccurrences { entity } => {
                write!(f, "tombstoned entity {} still has occurrences", entity)
            }
            IntegrityViolation::UnknownArtifact { entity, artifact } => {
                write!(f, "entity {} occurs in unknown artifact {}", entity, artifact)
            }
            IntegrityViolation::Index { detail } => write!(f, "index: {}", detail),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub version: GraphVersion,
    pub entities_checked: usize,
    pub edges_checked: usize,
    pub violations: Vec<IntegrityViolation>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn summary(&self) -> String {
        match self.violations.first() {
            None => format!("{}: clean", self.version),
            Some(first) => format!(
                "{}: {} violation(s), first: {}",
                self.version,
                self.violations.len(),
                first
            ),
        }
    }
}

/// Full check of one snapshot.
pub fn verify(snapshot: &GraphSnapshot) -> IntegrityReport {
    let entities: BTreeSet<EntityId> = snapshot.entities().map(|e| e.id).collect();
    let mut report = check(snapshot, &entities, snapshot.edges());
    report.violations.extend(
        snapshot
            .index_violations()
            .into_iter()
            .map(|detail| IntegrityViolation::Index { detail }),
    );
    report
}

/// Checks only what a write set touched, after it was applied.
pub fn verify_write_set(snapshot: &GraphSnapshot, write_set: &WriteSet) -> IntegrityReport {
    let entities: BTreeSet<EntityId> = write_set
        .footprint()
        .into_iter()
        .filter(|id| snapshot.entity(id).is_some())
        .collect();
    let edge_keys: BTreeSet<EdgeKey> = write_set.edges.iter().map(|c| c.key()).collect();
    check(
        snapshot,
        &entities,
        edge_keys.iter().filter_map(|k| snapshot.edge(k)),
    )
}

fn check<'a>(
    snapshot: &GraphSnapshot,
    entities: &BTreeSet<EntityId>,
    edges: impl Iterator<Item = &'a Edge>,
) -> IntegrityReport {
    let mut report = IntegrityReport {
        version: snapshot.version(),
        entities_checked: entities.len(),
        ..Default::default()
    };

    for id in entities {
        let Some(entity) = snapshot.entity(id) else {
            continue;
        };
        match (entity.is_live(), entity.occurrences.is_empty()) {
            (true, true) => report
                .violations
                .push(IntegrityViolation::LiveWithoutOccurrences { entity: *id }),
            (false, false) => report
                .violations
                .push(IntegrityViolation::TombstoneWithOccurrences { entity: *id }),
            _ => {}
        }
        for artifact in entity.artifacts() {
            if snapshot.artifact(artifact).is_none() {
                report.violations.push(IntegrityViolation::UnknownArtifact {
                    entity: *id,
                    artifact: artifact.to_string(),
                });
            }
        }
    }

    for edge in edges {
        report.edges_checked += 1;
        for endpoint in [edge.source(), edge.target()] {
            match snapshot.entity(&endpoint) {
                None => report.violations.push(IntegrityViolation::MissingEndpoint {
                    edge: edge.key,
                    entity: endpoint,
                }),
                Some(e) if !e.is_live() && edge.kind() != EdgeKind::RenamedTo => {
                    report.violations.push(IntegrityViolation::TombstonedEndpoint {
                        edge: edge.key,
                        entity: endpoint,
                    })
                }
                Some(_) => {}
            }
        }
        if edge.provenance.is_empty() {
            report
                .violations
                .push(IntegrityViolation::EmptyProvenance { edge: edge.key });
        }
        for prov in &edge.provenance {
            let live = snapshot
                .artifact(prov.artifact())
                .map(|a| a.revision == prov.revision())
                .unwrap_or(false);
            if !live {
                report.violations.push(IntegrityViolation::StaleProvenance {
                    edge: edge.key,
                    artifact: prov.artifact().to_string(),
                    revision: prov.revision().to_string(),
                });
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EdgeProvenance, Entity};
    use crate::write_set::EntityChange;
    use impactgraph_core::{CanonicalKey, Confidence, EntityKind, Location, Provenance};

    #[test]
    fn dangling_edge_is_reported() {
        let mut snapshot = GraphSnapshot::empty();
        let ghost = EntityId::new();
        let mut lonely = Entity::new(
            EntityKind::Document,
            "README.md",
            CanonicalKey::new(EntityKind::Document, "readme.md"),
        );
        lonely.tombstoned_at = Some(GraphVersion(1));
        snapshot
            .apply(
                GraphVersion(1),
                &WriteSet {
                    entities: vec![EntityChange::Upsert {
                        entity: lonely.clone(),
                        created: true,
                    }],
                    ..Default::default()
                },
            )
            .unwrap();

        let mut edge = Edge::new(EdgeKey::new(lonely.id, EdgeKind::Documents, ghost));
        edge.provenance.insert(EdgeProvenance {
            provenance: Provenance {
                artifact: "README.md".into(),
                revision: "r1".into(),
                location: Location::line(2),
            },
            confidence: Confidence::CERTAIN,
        });
        snapshot.insert_raw_edge(edge);

        let report = verify(&snapshot);
        assert!(!report.is_clean());
        assert!(report
            .violations
            .iter()
            .any(|v| matches!(v, IntegrityViolation::MissingEndpoint { entity, .. } if *entity == ghost)));
        assert!(report
            .violations
            .iter()
            .any(|v| matches!(v, IntegrityViolation::TombstonedEndpoint { .. })));
        assert!(report
            .violations
            .iter()
            .any(|v| matches!(v, IntegrityViolation::StaleProvenance { .. })));
    }

    #[test]
    fn empty_snapshot_is_clean() {
        let report = verify(&GraphSnapshot::empty());
        assert!(report.is_clean());
        assert!(report.summary().ends_with("clean"));
    }
}
