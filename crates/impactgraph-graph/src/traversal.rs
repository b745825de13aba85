//! Bounded weighted traversal over a pinned snapshot.
//!
//! The walk is a per-hop relaxation over `(entity, state)` pairs: each level
//! extends the previous frontier by exactly one edge, multiplying relevance by
//! `decay * confidence`. Callers encode which edge sequences are meaningful in
//! a [`TraversalPolicy`]; the walk itself knows nothing about impact or
//! context semantics.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use impactgraph_core::{EdgeKind, EntityId, Result, StepGuard};
use tracing::trace;

use crate::model::{Edge, EdgeKey, Entity};
use crate::snapshot::GraphSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Follow edges from source to target.
    Outgoing,
    /// Follow edges from target back to source.
    Incoming,
    Both,
}

pub trait TraversalPolicy {
    type State: Clone + Ord + Debug;

    fn initial(&self) -> Self::State;

    fn direction(&self) -> Direction;

    /// State after crossing an edge of `kind` as the `hop`-th step (1-based).
    /// `None` prunes the path.
    fn transition(&self, state: &Self::State, kind: EdgeKind, hop: u32) -> Option<Self::State>;

    fn admits(&self, entity: &Entity) -> bool {
        entity.is_live()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraversalConfig {
    pub hop_limit: u32,
    pub decay: f64,
}

/// Best path found to one entity in one state.
#[derive(Debug, Clone, PartialEq)]
pub struct Reached<S> {
    pub entity: EntityId,
    pub state: S,
    pub relevance: f64,
    pub hops: u32,
    /// Last edge on the best path.
    pub via: EdgeKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraversalResult<S> {
    /// One entry per `(entity, state)` pair reached within the hop limit.
    pub reached: Vec<Reached<S>>,
    /// Every entity the walk looked at, seeds and probed neighbours included.
    pub visited: BTreeSet<EntityId>,
    /// Some entity is reachable only beyond the hop limit.
    pub truncated: bool,
}

impl<S> TraversalResult<S> {
    pub fn entities(&self) -> BTreeSet<EntityId> {
        self.reached.iter().map(|r| r.entity).collect()
    }
}

fn incident<'a>(
    snapshot: &'a GraphSnapshot,
    id: &EntityId,
    direction: Direction,
) -> Box<dyn Iterator<Item = &'a Edge> + 'a> {
    match direction {
        Direction::Outgoing => Box::new(snapshot.outgoing(id)),
        Direction::Incoming => Box::new(snapshot.incoming(id)),
        Direction::Both => Box::new(snapshot.outgoing(id).chain(snapshot.incoming(id))),
    }
}

/// Walks from `seeds` under `policy`. Seeds are never reported as reached.
pub fn walk<P: TraversalPolicy>(
    snapshot: &GraphSnapshot,
    seeds: &BTreeSet<EntityId>,
    policy: &P,
    config: TraversalConfig,
    guard: &mut StepGuard,
) -> Result<TraversalResult<P::State>> {
    let direction = policy.direction();
    let mut visited: BTreeSet<EntityId> = seeds.clone();
    let mut best: BTreeMap<(EntityId, P::State), Reached<P::State>> = BTreeMap::new();
    let mut frontier: BTreeMap<(EntityId, P::State), f64> = seeds
        .iter()
        .filter(|id| snapshot.entity(id).is_some())
        .map(|id| ((*id, policy.initial()), 1.0))
        .collect();

    for hop in 1..=config.hop_limit {
        let mut next: BTreeMap<(EntityId, P::State), (f64, EdgeKey)> = BTreeMap::new();
        for ((id, state), relevance) in &frontier {
            for edge in incident(snapshot, id, direction) {
                guard.check()?;
                let Some(neighbour) = edge.key.other(*id) else {
                    continue;
                };
                if seeds.contains(&neighbour) {
                    continue;
                }
                let Some(entity) = snapshot.entity(&neighbour) else {
                    continue;
                };
                visited.insert(neighbour);
                if !policy.admits(entity) {
                    continue;
                }
                let Some(next_state) = policy.transition(state, edge.kind(), hop) else {
                    continue;
                };
                let score = relevance * config.decay * edge.confidence();
                let slot = (neighbour, next_state);
                if best.get(&slot).map_or(false, |r| r.relevance >= score) {
                    continue;
                }
                match next.get(&slot) {
                    Some((existing, _)) if *existing >= score => {}
                    _ => {
                        next.insert(slot, (score, edge.key));
                    }
                }
            }
        }

        frontier = BTreeMap::new();
        for ((entity, state), (relevance, via)) in next {
            best.insert(
                (entity, state.clone()),
                Reached {
                    entity,
                    state: state.clone(),
                    relevance,
                    hops: hop,
                    via,
                },
            );
            frontier.insert((entity, state), relevance);
        }
        trace!(hop, frontier = frontier.len(), "Traversal level done");
        if frontier.is_empty() {
            break;
        }
    }

    let reached_entities: BTreeSet<EntityId> = best.keys().map(|(id, _)| *id).collect();
    let mut truncated = false;
    'probe: for (id, state) in frontier.keys() {
        for edge in incident(snapshot, id, direction) {
            guard.check()?;
            let Some(neighbour) = edge.key.other(*id) else {
                continue;
            };
            if seeds.contains(&neighbour) || reached_entities.contains(&neighbour) {
                continue;
            }
            let admitted = snapshot
                .entity(&neighbour)
                .map_or(false, |e| policy.admits(e));
            if admitted
                && policy
                    .transition(state, edge.kind(), config.hop_limit + 1)
                    .is_some()
            {
                truncated = true;
                break 'probe;
            }
        }
    }

    Ok(TraversalResult {
        reached: best.into_values().collect(),
        visited,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EdgeProvenance;
    use crate::write_set::{EdgeChange, EntityChange, WriteSet};
    use approx::assert_relative_eq;
    use impactgraph_core::{
        CanonicalKey, Confidence, EntityKind, GraphVersion, Location, Provenance, QueryOptions,
    };
    use std::time::Duration;

    struct Follow(Direction);

    impl TraversalPolicy for Follow {
        type State = ();

        fn initial(&self) -> Self::State {}

        fn direction(&self) -> Direction {
            self.0
        }

        fn transition(&self, _: &(), kind: EdgeKind, _: u32) -> Option<()> {
            (kind == EdgeKind::References).then_some(())
        }
    }

    /// a <- b <- c <- d, all REFERENCES with the given confidences.
    fn chain(confidences: [f64; 3]) -> (GraphSnapshot, Vec<EntityId>) {
        let mut entities = Vec::new();
        let mut ws = WriteSet::default();
        for name in ["a", "b", "c", "d"] {
            let mut entity = Entity::new(
                EntityKind::Method,
                name,
                CanonicalKey::new(EntityKind::Method, name),
            );
            entity.occurrences.insert(crate::model::Occurrence {
                artifact: "x.rs".into(),
                location: Location::line(1),
                raw_name: name.into(),
            });
            entities.push(entity.id);
            ws.entities.push(EntityChange::Upsert {
                entity,
                created: true,
            });
        }
        for (i, confidence) in confidences.iter().enumerate() {
            let mut edge = Edge::new(EdgeKey::new(
                entities[i + 1],
                EdgeKind::References,
                entities[i],
            ));
            edge.provenance.insert(EdgeProvenance {
                provenance: Provenance {
                    artifact: "x.rs".into(),
                    revision: "r".into(),
                    location: Location::line(i as u32 + 2),
                },
                confidence: Confidence::new(*confidence).unwrap(),
            });
            ws.edges.push(EdgeChange::Upsert {
                edge,
                created: true,
            });
        }
        let mut snapshot = GraphSnapshot::empty();
        snapshot.apply(GraphVersion(1), &ws).unwrap();
        (snapshot, entities)
    }

    #[test]
    fn relevance_decays_per_hop() {
        let (snapshot, ids) = chain([1.0, 0.5, 1.0]);
        let result = walk(
            &snapshot,
            &BTreeSet::from([ids[0]]),
            &Follow(Direction::Incoming),
            TraversalConfig {
                hop_limit: 3,
                decay: 0.8,
            },
            &mut StepGuard::unbounded(),
        )
        .unwrap();

        assert_eq!(result.reached.len(), 3);
        let c = result.reached.iter().find(|r| r.entity == ids[2]).unwrap();
        assert_eq!(c.hops, 2);
        assert_relative_eq!(c.relevance, 0.8 * 0.8 * 0.5);
        assert!(!result.truncated);
    }

    #[test]
    fn hop_limit_sets_truncated() {
        let (snapshot, ids) = chain([1.0, 1.0, 1.0]);
        let result = walk(
            &snapshot,
            &BTreeSet::from([ids[0]]),
            &Follow(Direction::Incoming),
            TraversalConfig {
                hop_limit: 2,
                decay: 0.8,
            },
            &mut StepGuard::unbounded(),
        )
        .unwrap();
        assert_eq!(result.entities(), BTreeSet::from([ids[1], ids[2]]));
        assert!(result.truncated);
    }

    #[test]
    fn direction_is_respected() {
        let (snapshot, ids) = chain([1.0, 1.0, 1.0]);
        let result = walk(
            &snapshot,
            &BTreeSet::from([ids[0]]),
            &Follow(Direction::Outgoing),
            TraversalConfig {
                hop_limit: 3,
                decay: 0.8,
            },
            &mut StepGuard::unbounded(),
        )
        .unwrap();
        assert!(result.reached.is_empty());
        assert!(!result.truncated);
    }

    #[test]
    fn expired_guard_aborts_the_walk() {
        let (snapshot, ids) = chain([1.0, 1.0, 1.0]);
        let mut guard = StepGuard::new(&QueryOptions::with_timeout(Duration::ZERO));
        let err = walk(
            &snapshot,
            &BTreeSet::from([ids[0]]),
            &Follow(Direction::Incoming),
            TraversalConfig {
                hop_limit: 3,
                decay: 0.8,
            },
            &mut guard,
        )
        .unwrap_err();
        assert!(matches!(err, impactgraph_core::ImpactGraphError::Timeout(_)));
    }
}
