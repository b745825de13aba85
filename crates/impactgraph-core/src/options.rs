use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::{ImpactGraphError, Result};

/// Caller-supplied limits for graph updates.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Elapsed timeouts leave the graph unchanged.
    pub timeout: Option<Duration>,
}

impl UpdateOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Caller-supplied limits for read queries.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl QueryOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Checked at every traversal step boundary so long walks can be abandoned
/// without leaving partial state behind.
#[derive(Debug, Clone)]
pub struct StepGuard {
    deadline: Option<(Instant, Duration)>,
    cancel: Option<CancellationToken>,
    steps: u64,
}

impl StepGuard {
    pub fn unbounded() -> Self {
        Self {
            deadline: None,
            cancel: None,
            steps: 0,
        }
    }

    pub fn new(options: &QueryOptions) -> Self {
        Self {
            deadline: options.timeout.map(|t| (Instant::now() + t, t)),
            cancel: options.cancel.clone(),
            steps: 0,
        }
    }

    pub fn check(&mut self) -> Result<()> {
        self.steps += 1;
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Err(ImpactGraphError::Cancelled);
            }
        }
        if let Some((deadline, timeout)) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ImpactGraphError::Timeout(timeout));
            }
        }
        Ok(())
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }
}
