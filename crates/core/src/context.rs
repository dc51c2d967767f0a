//! Per-request execution context.

use crate::error::ContextError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// User ids that upstream code has historically used as stand-ins for "no user".
const PLACEHOLDER_USER_IDS: &[&str] = &[
    "none",
    "null",
    "nil",
    "undefined",
    "placeholder",
    "default",
    "default_user",
    "anonymous",
    "unknown",
    "system",
    "registry",
];

/// Identity handed over by the authentication service. Trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub user_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl VerifiedIdentity {
    pub fn new(user_id: impl Into<String>, permissions: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            permissions,
        }
    }
}

/// Opaque handle to the database session owned by one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(Uuid);

impl SessionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Isolated state bundle for exactly one (user, request) pair.
///
/// All values are owned; cloning a context deep-copies `agent_context`,
/// so a copy handed out by a store can be mutated freely without
/// reaching the stored original or any other user's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserExecutionContext {
    pub user_id: String,
    pub thread_id: String,
    pub run_id: String,
    pub session_id: String,
    pub workspace_id: String,
    pub websocket_client_id: Option<String>,
    pub agent_context: HashMap<String, Value>,
    pub db_session: Option<SessionHandle>,
    pub audit_metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "optional_secs")]
    pub ttl: Option<Duration>,
}

impl UserExecutionContext {
    /// Create a context, validating the identifying fields.
    ///
    /// # Errors
    /// Returns `ContextError::InvalidContext` for empty ids or a placeholder user id.
    pub fn new(
        user_id: impl Into<String>,
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Result<Self, ContextError> {
        let context = Self {
            user_id: user_id.into(),
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            session_id: Uuid::new_v4().to_string(),
            workspace_id: String::from("default"),
            websocket_client_id: None,
            agent_context: HashMap::new(),
            db_session: None,
            audit_metadata: HashMap::new(),
            created_at: Utc::now(),
            ttl: None,
        };
        context.validate()?;
        Ok(context)
    }

    /// Build a context from an upstream-verified identity.
    pub fn from_identity(
        identity: &VerifiedIdentity,
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Result<Self, ContextError> {
        let context = Self::new(identity.user_id.clone(), thread_id, run_id)?;
        Ok(context.with_audit_field(
            "permissions",
            Value::from(identity.permissions.clone()),
        ))
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_workspace_id(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = workspace_id.into();
        self
    }

    pub fn with_websocket_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.websocket_client_id = Some(client_id.into());
        self
    }

    pub fn with_agent_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.agent_context.insert(key.into(), value);
        self
    }

    pub fn with_audit_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.audit_metadata.insert(key.into(), value);
        self
    }

    pub fn with_db_session(mut self, handle: SessionHandle) -> Self {
        self.db_session = Some(handle);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Re-check the invariants. Fields are public, so stores call this again
    /// before accepting a context.
    pub fn validate(&self) -> Result<(), ContextError> {
        validate_user_id(&self.user_id)?;
        if self.thread_id.trim().is_empty() {
            return Err(ContextError::InvalidContext(
                "thread_id must be non-empty".to_string(),
            ));
        }
        if self.run_id.trim().is_empty() {
            return Err(ContextError::InvalidContext(
                "run_id must be non-empty".to_string(),
            ));
        }
        if let Some(client_id) = &self.websocket_client_id {
            if client_id.trim().is_empty() {
                return Err(ContextError::InvalidContext(
                    "websocket_client_id must be non-empty when set".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Canonical registration key: `user_id:thread_id:run_id`.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.user_id, self.thread_id, self.run_id)
    }
}

/// Reject empty and placeholder user ids.
pub fn validate_user_id(user_id: &str) -> Result<(), ContextError> {
    let normalized = user_id.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(ContextError::InvalidContext(
            "user_id must be non-empty".to_string(),
        ));
    }
    if PLACEHOLDER_USER_IDS.contains(&normalized.as_str()) || normalized.starts_with("placeholder_")
    {
        return Err(ContextError::InvalidContext(format!(
            "user_id '{}' is a placeholder value",
            user_id
        )));
    }
    Ok(())
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        match secs {
            Some(s) if s.is_finite() && s >= 0.0 => Ok(Some(Duration::from_secs_f64(s))),
            Some(s) => Err(serde::de::Error::custom(format!("invalid ttl: {}", s))),
            None => Ok(None),
        }
    }
}
