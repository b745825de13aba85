//! Context bundle types, sizing and query signatures.

use std::fmt;

use impactgraph_core::{EntityId, EntityKind, GraphVersion, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domains::Domain;
use crate::intent::QueryIntent;
use crate::tools::ToolDescriptor;

/// Size estimate in tokens: one token per four bytes, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Trims and collapses whitespace. Case is kept: seed inference splits
/// identifiers on case boundaries.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable identity of a context request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuerySignature(String);

impl QuerySignature {
    pub fn compute(query: &str, focal: &[EntityId], budget: usize) -> Self {
        let mut focal: Vec<EntityId> = focal.to_vec();
        focal.sort();
        focal.dedup();

        let mut hasher = Sha256::new();
        hasher.update(normalize_query(query).as_bytes());
        hasher.update([0u8]);
        for id in &focal {
            hasher.update(id.0.as_bytes());
        }
        hasher.update([0u8]);
        hasher.update((budget as u64).to_le_bytes());
        let digest = hasher.finalize();
        Self(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: EntityId,
    pub kind: EntityKind,
    pub canonical_name: String,
    pub relevance: f64,
    pub hops: u32,
    pub artifacts: Vec<String>,
    pub size: usize,
}

impl ContextItem {
    pub fn new(
        id: EntityId,
        kind: EntityKind,
        canonical_name: impl Into<String>,
        relevance: f64,
        hops: u32,
        artifacts: Vec<String>,
    ) -> Self {
        let mut item = Self {
            id,
            kind,
            canonical_name: canonical_name.into(),
            relevance,
            hops,
            artifacts,
            size: 0,
        };
        item.size = estimate_tokens(&item.render());
        item
    }

    pub fn render(&self) -> String {
        format!(
            "{} {} (relevance {:.3}, {} hops) in {}",
            self.kind.as_str(),
            self.canonical_name,
            self.relevance,
            self.hops,
            self.artifacts.join(", ")
        )
    }
}

/// Fixed part of every bundle; never trimmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreLayer {
    pub intent: QueryIntent,
    pub lines: Vec<String>,
    pub size: usize,
}

impl CoreLayer {
    pub fn new(intent: QueryIntent, lines: Vec<String>) -> Self {
        let size = lines.iter().map(|l| estimate_tokens(l)).sum();
        Self {
            intent,
            lines,
            size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainLayer {
    pub domain: Domain,
    /// Relevance desc, canonical name asc.
    pub items: Vec<ContextItem>,
}

impl DomainLayer {
    pub fn size(&self) -> usize {
        self.items.iter().map(|i| i.size).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub signature: QuerySignature,
    /// Graph version the bundle was assembled against.
    pub version: GraphVersion,
    pub intent: QueryIntent,
    pub domains: Vec<Domain>,
    pub core_layer: CoreLayer,
    pub domain_layers: Vec<DomainLayer>,
    pub tool_descriptors: Vec<ToolDescriptor>,
    pub budget: usize,
    pub total_size: usize,
    /// Items or tools were dropped to respect the budget or per-domain caps.
    pub truncated: bool,
}

impl ContextBundle {
    pub fn item_count(&self) -> usize {
        self.domain_layers.iter().map(|l| l.items.len()).sum()
    }

    pub fn items(&self) -> impl Iterator<Item = &ContextItem> {
        self.domain_layers.iter().flat_map(|l| l.items.iter())
    }

    pub fn layer(&self, domain: Domain) -> Option<&DomainLayer> {
        self.domain_layers.iter().find(|l| l.domain == domain)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
