use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImpactGraphError {
    /// Malformed change event or changeset.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Optimistic update retries exhausted; the artifact must be re-extracted.
    #[error("Update conflict on '{path}' after {attempts} attempts")]
    Conflict { path: String, attempts: u32 },

    #[error("Not found: {0}")]
    NotFound(String),

    /// The core layer alone does not fit into the requested budget.
    #[error("Budget exceeded: core layer needs {core_size} units, budget is {budget}")]
    BudgetExceeded { core_size: usize, budget: usize },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Operation cancelled")]
    Cancelled,

    /// Invariant violation detected while building or committing a transaction.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// The store detected a violated invariant and refuses writes until repaired.
    #[error("Writes halted pending repair: {0}")]
    WritesHalted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ImpactGraphError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Only a halted store is fatal; everything else is a per-call failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::WritesHalted(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Timeout(_))
    }
}

impl From<config::ConfigError> for ImpactGraphError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ImpactGraphError>;
