//! Audit records for context registration.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// What `get_audit_trail` exposes for one key. Holds data from that
/// key's context only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub key: String,
    pub user_id: String,
    pub thread_id: String,
    pub run_id: String,
    pub session_id: String,
    pub context_set_at: DateTime<Utc>,
    pub audit_fields: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    ContextSet,
    ContextCleared,
    ContextExpired,
    ContextRejected,
}

impl AuditEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEventKind::ContextSet => "context_set",
            AuditEventKind::ContextCleared => "context_cleared",
            AuditEventKind::ContextExpired => "context_expired",
            AuditEventKind::ContextRejected => "context_rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub kind: AuditEventKind,
    pub key: String,
    pub user_id: String,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, key: &str, user_id: &str) -> Self {
        Self {
            kind,
            key: key.to_string(),
            user_id: user_id.to_string(),
            at: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Downstream audit persistence. Must not block or fail the caller.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Writes audit events to the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        tracing::info!(
            target: "audit",
            kind = event.kind.as_str(),
            key = %event.key,
            user_id = %event.user_id,
            detail = event.detail.as_deref().unwrap_or(""),
            "context audit event"
        );
    }
}
