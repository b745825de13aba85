//! Budget-bounded context assembly.
//!
//! Assembly is a pure function of the request and the pinned snapshot:
//! intent and domains come from fixed tables, the subgraph from one bounded
//! walk, and trimming breaks every tie by name so two runs against the same
//! version produce byte-identical bundles.

use std::collections::{BTreeMap, BTreeSet};

use impactgraph_core::{
    AliasKey, ContextSettings, EdgeKind, EntityId, ImpactGraphError, QueryOptions, Result,
    StepGuard, TransformRegistry,
};
use impactgraph_graph::{walk, Direction, Entity, GraphSnapshot, TraversalConfig, TraversalPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::bundle::{
    estimate_tokens, normalize_query, ContextBundle, ContextItem, CoreLayer, DomainLayer,
    QuerySignature,
};
use crate::domains::{match_domains, Domain};
use crate::intent::classify_intent;
use crate::tools::{ToolDescriptor, ToolRegistry};

const MIN_TERM_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRequest {
    pub query: String,
    pub focal: Vec<EntityId>,
    /// Size limit in estimated tokens.
    pub budget: usize,
}

impl ContextRequest {
    pub fn new(query: impl Into<String>, budget: usize) -> Self {
        Self {
            query: query.into(),
            focal: Vec::new(),
            budget,
        }
    }

    pub fn with_focal(mut self, focal: impl IntoIterator<Item = EntityId>) -> Self {
        self.focal.extend(focal);
        self
    }

    pub fn signature(&self) -> QuerySignature {
        QuerySignature::compute(&self.query, &self.focal, self.budget)
    }
}

/// A bundle plus the graph state it was derived from.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub bundle: ContextBundle,
    pub seeds: BTreeSet<EntityId>,
    pub visited: BTreeSet<EntityId>,
    pub probed_keys: BTreeSet<AliasKey>,
}

/// Undirected walk over every relationship except rename history.
struct ContextPolicy;

impl TraversalPolicy for ContextPolicy {
    type State = ();

    fn initial(&self) -> Self::State {}

    fn direction(&self) -> Direction {
        Direction::Both
    }

    fn transition(&self, _state: &(), kind: EdgeKind, _hop: u32) -> Option<()> {
        (kind != EdgeKind::RenamedTo).then_some(())
    }
}

/// Something the trimmer may drop.
enum Candidate {
    Item { layer: usize, id: EntityId },
    Tool(String),
}

#[derive(Debug, Clone)]
pub struct ContextAssembler {
    settings: ContextSettings,
}

impl ContextAssembler {
    pub fn new(settings: ContextSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    #[instrument(
        skip(self, snapshot, registry, request, options),
        fields(version = %snapshot.version(), budget = request.budget)
    )]
    pub fn assemble(
        &self,
        snapshot: &GraphSnapshot,
        registry: &TransformRegistry,
        request: &ContextRequest,
        options: &QueryOptions,
    ) -> Result<Assembly> {
        let mut guard = StepGuard::new(options);

        let mut focal: Vec<&Entity> = Vec::new();
        for id in request.focal.iter().collect::<BTreeSet<_>>() {
            let entity = snapshot.live_entity(id).ok_or_else(|| {
                ImpactGraphError::not_found(format!("entity {} at {}", id, snapshot.version()))
            })?;
            focal.push(entity);
        }

        let (inferred, probed_keys) =
            self.infer_seeds(snapshot, registry, &request.query, &mut guard)?;
        let seeds: BTreeSet<EntityId> = focal
            .iter()
            .map(|e| e.id)
            .chain(inferred.iter().copied())
            .collect();

        let intent = classify_intent(&request.query);
        let domains = match_domains(intent, &request.query, focal.iter().map(|e| e.kind));

        let mut core_lines = vec![
            intent.preamble().to_string(),
            format!("Query: {}", normalize_query(&request.query)),
        ];
        for entity in seed_order(snapshot, &seeds) {
            core_lines.push(format!(
                "Seed {} {} in {}",
                entity.kind.as_str(),
                entity.canonical_name,
                entity.artifacts().into_iter().collect::<Vec<_>>().join(", ")
            ));
        }
        let core_layer = CoreLayer::new(intent, core_lines);
        if core_layer.size > request.budget {
            return Err(ImpactGraphError::BudgetExceeded {
                core_size: core_layer.size,
                budget: request.budget,
            });
        }

        let result = walk(
            snapshot,
            &seeds,
            &ContextPolicy,
            TraversalConfig {
                hop_limit: u32::try_from(self.settings.hop_limit).unwrap_or(u32::MAX),
                decay: self.settings.decay,
            },
            &mut guard,
        )?;

        let mut truncated = false;
        let mut by_domain: BTreeMap<Domain, Vec<ContextItem>> = BTreeMap::new();
        for reached in &result.reached {
            let Some(entity) = snapshot.entity(&reached.entity) else {
                continue;
            };
            let domain = Domain::of_kind(entity.kind);
            if !domains.contains(&domain) {
                continue;
            }
            by_domain.entry(domain).or_default().push(ContextItem::new(
                entity.id,
                entity.kind,
                entity.canonical_name.clone(),
                reached.relevance,
                reached.hops,
                entity.artifacts().into_iter().map(str::to_string).collect(),
            ));
        }
        let mut domain_layers: Vec<DomainLayer> = Vec::new();
        for (domain, mut items) in by_domain {
            items.sort_by(|a, b| {
                b.relevance
                    .total_cmp(&a.relevance)
                    .then_with(|| a.canonical_name.cmp(&b.canonical_name))
                    .then_with(|| a.id.cmp(&b.id))
            });
            if items.len() > self.settings.max_items_per_domain {
                items.truncate(self.settings.max_items_per_domain);
                truncated = true;
            }
            domain_layers.push(DomainLayer { domain, items });
        }

        let mut tool_descriptors = ToolRegistry::select(&domains);
        let mut total_size = core_layer.size
            + domain_layers.iter().map(DomainLayer::size).sum::<usize>()
            + tool_descriptors
                .iter()
                .map(|t| estimate_tokens(&t.render()))
                .sum::<usize>();

        if total_size > request.budget {
            let dropped = trim(
                &mut domain_layers,
                &mut tool_descriptors,
                total_size - request.budget,
            );
            total_size -= dropped;
            truncated = true;
        }
        domain_layers.retain(|l| !l.items.is_empty());

        let bundle = ContextBundle {
            signature: request.signature(),
            version: snapshot.version(),
            intent,
            domains: domains.into_iter().collect(),
            core_layer,
            domain_layers,
            tool_descriptors,
            budget: request.budget,
            total_size,
            truncated,
        };
        debug!(
            intent = %bundle.intent,
            seeds = seeds.len(),
            items = bundle.item_count(),
            tools = bundle.tool_descriptors.len(),
            size = bundle.total_size,
            truncated = bundle.truncated,
            steps = guard.steps(),
            "Context assembled"
        );

        Ok(Assembly {
            bundle,
            seeds,
            visited: result.visited,
            probed_keys,
        })
    }

    /// Entities named by query terms, in term order, capped.
    fn infer_seeds(
        &self,
        snapshot: &GraphSnapshot,
        registry: &TransformRegistry,
        query: &str,
        guard: &mut StepGuard,
    ) -> Result<(Vec<EntityId>, BTreeSet<AliasKey>)> {
        let mut seeds: Vec<EntityId> = Vec::new();
        let mut probed: BTreeSet<AliasKey> = BTreeSet::new();
        let mut seen_terms: BTreeSet<&str> = BTreeSet::new();

        for term in query_terms(query) {
            if seeds.len() >= self.settings.max_inferred_seeds {
                break;
            }
            if !seen_terms.insert(term) {
                continue;
            }
            guard.check()?;
            for key in registry.probe_keys(term) {
                let mut hits = snapshot.lookup_alias(&key);
                hits.sort();
                for id in hits {
                    if seeds.len() < self.settings.max_inferred_seeds && !seeds.contains(&id) {
                        seeds.push(id);
                    }
                }
                probed.insert(key);
            }
        }
        Ok((seeds, probed))
    }
}

fn query_terms(query: &str) -> impl Iterator<Item = &str> {
    query
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !(c.is_alphanumeric() || c == '_')))
        .filter(|t| t.chars().count() >= MIN_TERM_LEN)
}

fn seed_order<'a>(snapshot: &'a GraphSnapshot, seeds: &BTreeSet<EntityId>) -> Vec<&'a Entity> {
    let mut entities: Vec<&Entity> = seeds.iter().filter_map(|id| snapshot.entity(id)).collect();
    entities.sort_by(|a, b| {
        a.canonical_name
            .cmp(&b.canonical_name)
            .then_with(|| a.id.cmp(&b.id))
    });
    entities
}

/// Drops the least relevant items and tools until at least `excess` units
/// are freed. Returns the units freed.
fn trim(layers: &mut [DomainLayer], tools: &mut Vec<ToolDescriptor>, excess: usize) -> usize {
    let mut candidates: Vec<(f64, String, String, usize, Candidate)> = Vec::new();
    for (index, layer) in layers.iter().enumerate() {
        for item in &layer.items {
            candidates.push((
                item.relevance,
                item.canonical_name.clone(),
                item.id.to_string(),
                item.size,
                Candidate::Item {
                    layer: index,
                    id: item.id,
                },
            ));
        }
    }
    for tool in tools.iter() {
        candidates.push((
            tool.priority,
            tool.name.clone(),
            String::new(),
            estimate_tokens(&tool.render()),
            Candidate::Tool(tool.name.clone()),
        ));
    }
    candidates.sort_by(|a, b| {
        a.0.total_cmp(&b.0)
            .then_with(|| a.1.cmp(&b.1))
            .then_with(|| a.2.cmp(&b.2))
    });

    let mut freed = 0;
    for (_, _, _, size, candidate) in candidates {
        if freed >= excess {
            break;
        }
        match candidate {
            Candidate::Item { layer, id } => {
                if let Some(layer) = layers.get_mut(layer) {
                    layer.items.retain(|i| i.id != id);
                }
            }
            Candidate::Tool(name) => tools.retain(|t| t.name != name),
        }
        freed += size;
    }
    freed
}

#[cfg(test)]
mod tests {
    use super::*;
    use impactgraph_core::EntityKind;

    #[test]
    fn query_terms_strip_punctuation_and_short_words() {
        let terms: Vec<&str> =
            query_terms("what breaks if I rename findUserById? (see ${db.url})").collect();
        assert_eq!(
            terms,
            vec!["what", "breaks", "rename", "findUserById", "see", "db.url"]
        );
    }

    fn method(name: &str, relevance: f64) -> ContextItem {
        ContextItem::new(EntityId::new(), EntityKind::Method, name, relevance, 1, vec![])
    }

    #[test]
    fn trim_drops_lowest_relevance_first() {
        let low = method("b", 0.2);
        let tie = method("a", 0.2);
        let high = method("c", 0.9);
        let mut layers = vec![DomainLayer {
            domain: Domain::Code,
            items: vec![high.clone(), tie.clone(), low.clone()],
        }];
        let mut tools = Vec::new();
        let freed = trim(&mut layers, &mut tools, 1);
        assert_eq!(freed, tie.size);
        let names: Vec<&str> = layers[0]
            .items
            .iter()
            .map(|i| i.canonical_name.as_str())
            .collect();
        assert_eq!(names, vec!["c", "b"]);
    }
}
