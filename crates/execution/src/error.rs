use serde_json::Value;
use std::time::Duration;
use strata_core::StateTransitionError;
use thiserror::Error;

/// Everything known about an execution that ran out of time.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutFailure {
    pub agent_type: String,
    pub timeout: Duration,
    pub elapsed: Duration,
    /// Interim results pushed before the deadline; empty unless partial results are enabled.
    pub partial_results: Vec<Value>,
    /// Set when cleanup after cancellation failed. Never replaces the timeout itself.
    pub cleanup_error: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Execution of '{}' timed out after {:.2}s", .0.agent_type, .0.timeout.as_secs_f64())]
    Timeout(TimeoutFailure),

    #[error("Circuit breaker open for '{}', retry after {:.2}s", .agent_type, .retry_after.as_secs_f64())]
    CircuitOpen {
        agent_type: String,
        retry_after: Duration,
    },

    #[error("Execution of '{agent_type}' failed: {message}")]
    Failed { agent_type: String, message: String },

    #[error("Execution of '{agent_type}' panicked")]
    Panicked { agent_type: String },

    #[error("Execution of '{agent_type}' was cancelled")]
    Cancelled { agent_type: String },

    #[error("Run already executing: {0}")]
    AlreadyRunning(String),

    #[error("Run not tracked: {0}")]
    UnknownRun(String),

    #[error("Run {run_id} does not belong to user {user_id}")]
    NotOwner { run_id: String, user_id: String },

    #[error(transparent)]
    InvalidState(#[from] StateTransitionError),
}

impl ExecutionError {
    /// Errors the caller may retry with its own backoff policy.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ExecutionError::Timeout(_)
                | ExecutionError::CircuitOpen { .. }
                | ExecutionError::Failed { .. }
        )
    }

    pub fn partial_results(&self) -> &[Value] {
        match self {
            ExecutionError::Timeout(failure) => &failure.partial_results,
            _ => &[],
        }
    }
}
