//! Query and bundle cache for ImpactGraph.
//!
//! Entries remember which entities and identity keys they were computed
//! from; a graph delta only evicts the entries it actually affects.

pub mod cache;
pub mod invalidation;
pub mod metrics;

pub use cache::{CacheEntry, CacheKey, QueryCache};
pub use invalidation::CacheDependencies;
pub use metrics::CacheStats;
