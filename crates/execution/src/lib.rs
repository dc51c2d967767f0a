//! Timeout, circuit breaking and lifecycle tracking for agent executions.

pub mod adaptive;
pub mod circuit_breaker;
pub mod error;
pub mod manager;
pub mod scope;
pub mod tracker;

pub use adaptive::{AdaptiveTimeout, HISTORY_LIMIT};
pub use circuit_breaker::{Admission, BreakerStatus, CircuitBreakerState};
pub use error::{ExecutionError, TimeoutFailure};
pub use manager::ExecutionTimeoutManager;
pub use scope::{CleanupFuture, ExecutionScope};
pub use tracker::{ExecutionRecord, ExecutionTracker};
