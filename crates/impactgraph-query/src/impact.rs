//! Change-impact analysis.
//!
//! Impact flows from a symbol to its dependents: if `A REFERENCES B`,
//! mutating `B` affects `A`, so the walk follows edges backwards. Each path
//! carries a classification state; a path may only degrade
//! (Breaking -> TestOnly -> DocsOnly), never upgrade.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use impactgraph_core::{
    EdgeKind, EntityId, EntityKind, EntityRef, GraphVersion, ImpactGraphError, ImpactSettings,
    MutationKind, QueryOptions, Result, StepGuard, TransformRegistry,
};
use impactgraph_graph::{
    walk, Direction, EdgeKey, GraphSnapshot, Reached, TraversalConfig, TraversalPolicy,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Impact severity, least severe first so that `max` picks the worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImpactClass {
    DocsOnly,
    TestOnly,
    Breaking,
}

impl fmt::Display for ImpactClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImpactClass::DocsOnly => "DOCS_ONLY",
            ImpactClass::TestOnly => "TEST_ONLY",
            ImpactClass::Breaking => "BREAKING",
        };
        write!(f, "{}", s)
    }
}

/// Path state machine over dependent edges.
pub struct ImpactPolicy {
    pub mutation: MutationKind,
}

impl TraversalPolicy for ImpactPolicy {
    type State = ImpactClass;

    fn initial(&self) -> ImpactClass {
        ImpactClass::Breaking
    }

    fn direction(&self) -> Direction {
        Direction::Incoming
    }

    fn transition(&self, state: &ImpactClass, kind: EdgeKind, hop: u32) -> Option<ImpactClass> {
        match (state, kind) {
            (ImpactClass::Breaking, EdgeKind::References | EdgeKind::Overrides) => {
                // Dependents of a broken dependent are broken regardless of
                // the original mutation.
                (hop > 1 || self.mutation.invalidates(kind)).then_some(ImpactClass::Breaking)
            }
            (ImpactClass::Breaking | ImpactClass::TestOnly, EdgeKind::Tests) => {
                Some(ImpactClass::TestOnly)
            }
            (_, EdgeKind::Documents) => Some(ImpactClass::DocsOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactedEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub canonical_name: String,
    pub classification: ImpactClass,
    pub relevance: f64,
    pub hops: u32,
    /// Kind of the last edge on the best path.
    pub via: EdgeKind,
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactReport {
    pub root: EntityId,
    pub mutation: MutationKind,
    pub version: GraphVersion,
    pub breaking: Vec<ImpactedEntity>,
    pub test_only: Vec<ImpactedEntity>,
    pub docs_only: Vec<ImpactedEntity>,
    /// Reached entities whose relevance fell below the floor, any class.
    pub low_confidence: Vec<ImpactedEntity>,
    /// Some dependent exists beyond the hop limit.
    pub truncated: bool,
    /// Every entity the analysis looked at, for cache invalidation.
    pub visited: BTreeSet<EntityId>,
}

impl ImpactReport {
    pub fn total(&self) -> usize {
        self.breaking.len() + self.test_only.len() + self.docs_only.len() + self.low_confidence.len()
    }

    pub fn all(&self) -> impl Iterator<Item = &ImpactedEntity> {
        self.breaking
            .iter()
            .chain(self.test_only.iter())
            .chain(self.docs_only.iter())
            .chain(self.low_confidence.iter())
    }
}

/// Ordering key: severity desc, relevance desc, canonical name asc, id asc.
fn report_order(a: &ImpactedEntity, b: &ImpactedEntity) -> std::cmp::Ordering {
    b.classification
        .cmp(&a.classification)
        .then_with(|| b.relevance.total_cmp(&a.relevance))
        .then_with(|| a.canonical_name.cmp(&b.canonical_name))
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Clone)]
pub struct ImpactAnalyzer {
    settings: ImpactSettings,
}

impl ImpactAnalyzer {
    pub fn new(settings: ImpactSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ImpactSettings {
        &self.settings
    }

    /// Resolves a raw mention first, then analyzes it.
    pub fn analyze_ref(
        &self,
        snapshot: &GraphSnapshot,
        registry: &TransformRegistry,
        entity: &EntityRef,
        mutation: MutationKind,
        options: &QueryOptions,
    ) -> Result<ImpactReport> {
        let id = snapshot
            .resolve(registry, entity)
            .ok_or_else(|| ImpactGraphError::not_found(format!("entity {}", entity)))?;
        self.analyze(snapshot, id, mutation, options)
    }

    #[instrument(skip(self, snapshot, options), fields(version = %snapshot.version()))]
    pub fn analyze(
        &self,
        snapshot: &GraphSnapshot,
        root: EntityId,
        mutation: MutationKind,
        options: &QueryOptions,
    ) -> Result<ImpactReport> {
        if snapshot.live_entity(&root).is_none() {
            return Err(ImpactGraphError::not_found(format!(
                "entity {} at {}",
                root,
                snapshot.version()
            )));
        }

        let seeds = rename_predecessors(snapshot, root);
        let mut guard = StepGuard::new(options);
        let result = walk(
            snapshot,
            &seeds,
            &ImpactPolicy { mutation },
            TraversalConfig {
                hop_limit: u32::try_from(self.settings.hop_limit).unwrap_or(u32::MAX),
                decay: self.settings.decay,
            },
            &mut guard,
        )?;

        // Most severe class wins; its best path supplies relevance and hops.
        let mut worst: BTreeMap<EntityId, &Reached<ImpactClass>> = BTreeMap::new();
        for reached in &result.reached {
            let replace = match worst.get(&reached.entity) {
                None => true,
                Some(current) => (reached.state, reached.relevance) > (current.state, current.relevance),
            };
            if replace {
                worst.insert(reached.entity, reached);
            }
        }

        let mut report = ImpactReport {
            root,
            mutation,
            version: snapshot.version(),
            breaking: Vec::new(),
            test_only: Vec::new(),
            docs_only: Vec::new(),
            low_confidence: Vec::new(),
            truncated: result.truncated,
            visited: result.visited.clone(),
        };
        for (id, reached) in worst {
            let Some(entity) = snapshot.entity(&id) else {
                continue;
            };
            let impacted = ImpactedEntity {
                id,
                kind: entity.kind,
                canonical_name: entity.canonical_name.clone(),
                classification: reached.state,
                relevance: reached.relevance,
                hops: reached.hops,
                via: reached.via.kind,
                artifacts: entity.artifacts().into_iter().map(str::to_string).collect(),
            };
            let bucket = if impacted.relevance < self.settings.relevance_floor {
                &mut report.low_confidence
            } else {
                match impacted.classification {
                    ImpactClass::Breaking => &mut report.breaking,
                    ImpactClass::TestOnly => &mut report.test_only,
                    ImpactClass::DocsOnly => &mut report.docs_only,
                }
            };
            bucket.push(impacted);
        }
        for bucket in [
            &mut report.breaking,
            &mut report.test_only,
            &mut report.docs_only,
            &mut report.low_confidence,
        ] {
            bucket.sort_by(report_order);
        }

        debug!(
            breaking = report.breaking.len(),
            test_only = report.test_only.len(),
            docs_only = report.docs_only.len(),
            low_confidence = report.low_confidence.len(),
            truncated = report.truncated,
            steps = guard.steps(),
            "Impact analysis done"
        );
        Ok(report)
    }
}

/// The root plus every entity renamed into it, so dependents still pointing
/// at an old name are reported too.
fn rename_predecessors(snapshot: &GraphSnapshot, root: EntityId) -> BTreeSet<EntityId> {
    let mut seeds = BTreeSet::from([root]);
    let mut pending = vec![root];
    while let Some(id) = pending.pop() {
        let older: Vec<EdgeKey> = snapshot
            .incoming(&id)
            .filter(|e| e.kind() == EdgeKind::RenamedTo)
            .map(|e| e.key)
            .collect();
        for key in older {
            if seeds.insert(key.source) {
                pending.push(key.source);
            }
        }
    }
    seeds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(mutation: MutationKind) -> ImpactPolicy {
        ImpactPolicy { mutation }
    }

    #[test]
    fn paths_only_degrade() {
        let p = policy(MutationKind::Rename);
        assert_eq!(
            p.transition(&ImpactClass::Breaking, EdgeKind::References, 1),
            Some(ImpactClass::Breaking)
        );
        assert_eq!(
            p.transition(&ImpactClass::Breaking, EdgeKind::Tests, 1),
            Some(ImpactClass::TestOnly)
        );
        assert_eq!(
            p.transition(&ImpactClass::TestOnly, EdgeKind::References, 2),
            None
        );
        assert_eq!(
            p.transition(&ImpactClass::TestOnly, EdgeKind::Documents, 2),
            Some(ImpactClass::DocsOnly)
        );
        assert_eq!(p.transition(&ImpactClass::DocsOnly, EdgeKind::Tests, 2), None);
        assert_eq!(
            p.transition(&ImpactClass::Breaking, EdgeKind::RenamedTo, 1),
            None
        );
        assert_eq!(p.transition(&ImpactClass::Breaking, EdgeKind::Declares, 1), None);
    }

    #[test]
    fn value_change_does_not_break_overrides_directly() {
        let p = policy(MutationKind::ValueChange);
        assert_eq!(p.transition(&ImpactClass::Breaking, EdgeKind::Overrides, 1), None);
        assert_eq!(
            p.transition(&ImpactClass::Breaking, EdgeKind::Overrides, 2),
            Some(ImpactClass::Breaking)
        );
        assert_eq!(
            policy(MutationKind::SignatureChange).transition(
                &ImpactClass::Breaking,
                EdgeKind::Overrides,
                1
            ),
            Some(ImpactClass::Breaking)
        );
    }

    #[test]
    fn severity_orders_breaking_first() {
        let mut classes = vec![ImpactClass::DocsOnly, ImpactClass::Breaking, ImpactClass::TestOnly];
        classes.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            classes,
            vec![ImpactClass::Breaking, ImpactClass::TestOnly, ImpactClass::DocsOnly]
        );
        assert_eq!(ImpactClass::DocsOnly.to_string(), "DOCS_ONLY");
    }
}
