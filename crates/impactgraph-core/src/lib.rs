//! Core types and shared plumbing for the ImpactGraph system.
//!
//! - `types`: entity/edge kinds, facts, change events, graph versions
//! - `identity`: naming-convention transforms and canonical keys
//! - `settings`: layered configuration
//! - `options`: caller-supplied timeouts and cancellation
//! - `telemetry`: tracing subscriber bootstrap

pub mod error;
pub mod identity;
pub mod options;
pub mod settings;
pub mod telemetry;
pub mod types;

pub use error::*;
pub use identity::*;
pub use options::*;
pub use settings::*;
pub use telemetry::*;
pub use types::*;

pub use tokio_util::sync::CancellationToken;
