//! Composition root for the coordination core.

pub mod commands;
pub mod coordinator;

pub use coordinator::{Coordinator, CoordinatorError};
