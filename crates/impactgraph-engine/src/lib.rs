//! ImpactGraph facade.
//!
//! Change events flow in through [`ImpactGraph::ingest`] /
//! [`ImpactGraph::ingest_stream`]; every commit bumps the graph version and
//! invalidates the affected cache entries. Queries run against a pinned
//! [`GraphHandle`](impactgraph_graph::GraphHandle) and consult the caches
//! first.

pub mod engine;
pub mod usage;

pub use engine::{EngineCacheStats, ImpactGraph, IngestOutcome};
pub use usage::{TracingUsageSink, UsageEvent, UsageSink};
