//! Usage analytics boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use impactgraph_core::{GraphVersion, Result};
use impactgraph_query::{ContextBundle, Domain, QueryIntent, QuerySignature};
use serde::{Deserialize, Serialize};
use tracing::info;

/// One served context request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub signature: QuerySignature,
    pub version: GraphVersion,
    pub intent: QueryIntent,
    pub domains: Vec<Domain>,
    pub items: usize,
    pub tools: usize,
    pub total_size: usize,
    pub budget: usize,
    pub truncated: bool,
    pub cache_hit: bool,
    pub elapsed_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl UsageEvent {
    pub fn from_bundle(bundle: &ContextBundle, cache_hit: bool, elapsed_ms: u64) -> Self {
        Self {
            signature: bundle.signature.clone(),
            version: bundle.version,
            intent: bundle.intent,
            domains: bundle.domains.clone(),
            items: bundle.item_count(),
            tools: bundle.tool_descriptors.len(),
            total_size: bundle.total_size,
            budget: bundle.budget,
            truncated: bundle.truncated,
            cache_hit,
            elapsed_ms,
            recorded_at: Utc::now(),
        }
    }
}

/// Receives usage events. Failures are logged by the caller and never fail
/// the query that produced the event.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, event: UsageEvent) -> Result<()>;
}

/// Default sink: one structured log line per event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, event: UsageEvent) -> Result<()> {
        info!(
            target: "impactgraph::usage",
            signature = %event.signature,
            version = %event.version,
            intent = %event.intent,
            items = event.items,
            tools = event.tools,
            size = event.total_size,
            budget = event.budget,
            truncated = event.truncated,
            cache_hit = event.cache_hit,
            elapsed_ms = event.elapsed_ms,
            "Context served"
        );
        Ok(())
    }
}
