//! Shared types for the multi-tenant execution coordination core.

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod state;

pub use config::{
    load_config, ContextConfig, CoreConfig, RouterConfig, TimeoutConfig, MAX_CONTEXTS_PER_USER,
};
pub use context::{validate_user_id, SessionHandle, UserExecutionContext, VerifiedIdentity};
pub use error::{ConfigError, ContextError, StateTransitionError};
pub use metrics::{Metrics, MetricsSnapshot};
pub use state::ExecutionState;
