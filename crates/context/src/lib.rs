//! Per-user execution context isolation.

pub mod audit;
pub mod manager;

pub use audit::{AuditEvent, AuditEventKind, AuditRecord, AuditSink, TracingAuditSink};
pub use manager::UserContextManager;
