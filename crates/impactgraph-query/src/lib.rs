//! Read-side queries over a pinned graph snapshot.
//!
//! - `impact`: classified dependents of a proposed mutation
//! - `intent` / `domains` / `tools`: fixed tables mapping a query to the
//!   knowledge domains and tools it needs
//! - `assembler` / `bundle`: budget-bounded, deterministic context bundles

pub mod assembler;
pub mod bundle;
pub mod domains;
pub mod impact;
pub mod intent;
pub mod tools;

pub use assembler::{Assembly, ContextAssembler, ContextRequest};
pub use bundle::{
    estimate_tokens, normalize_query, ContextBundle, ContextItem, CoreLayer, DomainLayer,
    QuerySignature,
};
pub use domains::{match_domains, Domain};
pub use impact::{ImpactAnalyzer, ImpactClass, ImpactPolicy, ImpactReport, ImpactedEntity};
pub use intent::{classify_intent, intent_scores, QueryIntent};
pub use tools::{ToolDescriptor, ToolRegistry};
