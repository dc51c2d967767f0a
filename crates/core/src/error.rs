use thiserror::Error;

use crate::state::ExecutionState;

/// Errors raised while validating, registering or retrieving a user context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Invalid context: {0}")]
    InvalidContext(String),

    #[error("Context isolation violation: {0}")]
    Isolation(String),

    #[error("Context not found: {0}")]
    NotFound(String),

    #[error("Context expired: {0}")]
    Expired(String),

    #[error("Resource limit exceeded for user {user_id}: {active}/{limit} active contexts")]
    ResourceLimit {
        user_id: String,
        active: usize,
        limit: usize,
    },
}

impl ContextError {
    /// Not-found and expired are the same outcome for callers: the context is gone.
    pub fn is_missing(&self) -> bool {
        matches!(self, ContextError::NotFound(_) | ContextError::Expired(_))
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Illegal execution state transition: {from:?} -> {to:?}")]
pub struct StateTransitionError {
    pub from: ExecutionState,
    pub to: ExecutionState,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
