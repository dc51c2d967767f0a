//! Wire types exchanged with connected clients.
//!
//! Every outbound frame is a JSON object with a `type` field. Critical events
//! additionally carry `run_id`, `user_id`, `timestamp` and a typed `payload`.

use crate::error::RouterError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// The five lifecycle notifications delivered at most once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalEventKind {
    AgentStarted,
    AgentThinking,
    ToolExecuting,
    ToolCompleted,
    AgentCompleted,
}

impl CriticalEventKind {
    pub const ALL: [CriticalEventKind; 5] = [
        CriticalEventKind::AgentStarted,
        CriticalEventKind::AgentThinking,
        CriticalEventKind::ToolExecuting,
        CriticalEventKind::ToolCompleted,
        CriticalEventKind::AgentCompleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CriticalEventKind::AgentStarted => "agent_started",
            CriticalEventKind::AgentThinking => "agent_thinking",
            CriticalEventKind::ToolExecuting => "tool_executing",
            CriticalEventKind::ToolCompleted => "tool_completed",
            CriticalEventKind::AgentCompleted => "agent_completed",
        }
    }

    /// Nothing may be emitted for a run after its terminal event.
    pub fn is_terminal(self) -> bool {
        self == CriticalEventKind::AgentCompleted
    }
}

impl fmt::Display for CriticalEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CriticalEventKind {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CriticalEventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| RouterError::UnknownEventType(s.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentStartedPayload {
    pub agent_type: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentThinkingPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolExecutingPayload {
    pub tool_name: String,
    pub arguments: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCompletedPayload {
    pub tool_name: String,
    pub result: Value,
    pub success: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ToolCompletedPayload {
    fn default() -> Self {
        Self {
            tool_name: String::new(),
            result: Value::Null,
            success: true,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCompletedPayload {
    pub result: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Typed payload, one schema per critical event kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    AgentStarted(AgentStartedPayload),
    AgentThinking(AgentThinkingPayload),
    ToolExecuting(ToolExecutingPayload),
    ToolCompleted(ToolCompletedPayload),
    AgentCompleted(AgentCompletedPayload),
}

impl EventPayload {
    /// Decode a raw payload against the schema for `kind`. `null` counts as
    /// an empty object.
    pub fn parse(kind: CriticalEventKind, value: Value) -> Result<Self, RouterError> {
        let value = match value {
            Value::Null => Value::Object(Map::new()),
            Value::Object(_) => value,
            other => {
                return Err(RouterError::InvalidPayload {
                    event_type: kind.as_str().to_string(),
                    reason: format!("expected an object, got {}", json_type(&other)),
                })
            }
        };

        let payload = match kind {
            CriticalEventKind::AgentStarted => {
                EventPayload::AgentStarted(decode(kind, value)?)
            }
            CriticalEventKind::AgentThinking => {
                EventPayload::AgentThinking(decode(kind, value)?)
            }
            CriticalEventKind::ToolExecuting => {
                EventPayload::ToolExecuting(decode(kind, value)?)
            }
            CriticalEventKind::ToolCompleted => {
                EventPayload::ToolCompleted(decode(kind, value)?)
            }
            CriticalEventKind::AgentCompleted => {
                EventPayload::AgentCompleted(decode(kind, value)?)
            }
        };
        Ok(payload)
    }

    pub fn kind(&self) -> CriticalEventKind {
        match self {
            EventPayload::AgentStarted(_) => CriticalEventKind::AgentStarted,
            EventPayload::AgentThinking(_) => CriticalEventKind::AgentThinking,
            EventPayload::ToolExecuting(_) => CriticalEventKind::ToolExecuting,
            EventPayload::ToolCompleted(_) => CriticalEventKind::ToolCompleted,
            EventPayload::AgentCompleted(_) => CriticalEventKind::AgentCompleted,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    kind: CriticalEventKind,
    value: Value,
) -> Result<T, RouterError> {
    serde_json::from_value(value).map_err(|e| RouterError::InvalidPayload {
        event_type: kind.as_str().to_string(),
        reason: e.to_string(),
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriticalEvent {
    #[serde(rename = "type")]
    pub kind: CriticalEventKind,
    pub run_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl CriticalEvent {
    pub fn new(run_id: &str, user_id: &str, payload: EventPayload) -> Self {
        Self {
            kind: payload.kind(),
            run_id: run_id.to_string(),
            user_id: user_id.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownMessageType,
    MalformedMessage,
    HandlerError,
}

/// Non-critical frames: connection status, replies, run-level signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemMessage {
    Connected {
        connection_id: String,
        user_id: String,
        client_id: String,
        resumed: bool,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Response {
        request_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        payload: Value,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// The run ended without `agent_completed`; carries whatever partial
    /// results were captured.
    RunFailed {
        run_id: String,
        reason: String,
        partial_results: Vec<Value>,
    },
    TemporarilyUnavailable {
        run_id: String,
        agent_type: String,
        retry_after_seconds: f64,
    },
    /// Forward-compatible escape hatch for frames this core does not model.
    Custom { event: String, data: Value },
}

impl SystemMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            SystemMessage::Connected { .. } => "connected",
            SystemMessage::Error { .. } => "error",
            SystemMessage::Response { .. } => "response",
            SystemMessage::Pong { .. } => "pong",
            SystemMessage::RunFailed { .. } => "run_failed",
            SystemMessage::TemporarilyUnavailable { .. } => "temporarily_unavailable",
            SystemMessage::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Critical(CriticalEvent),
    System(SystemMessage),
}

impl OutboundMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            OutboundMessage::Critical(event) => event.kind.as_str(),
            OutboundMessage::System(message) => message.message_type(),
        }
    }

    pub fn as_critical(&self) -> Option<&CriticalEvent> {
        match self {
            OutboundMessage::Critical(event) => Some(event),
            OutboundMessage::System(_) => None,
        }
    }

    pub fn to_json(&self) -> Result<String, RouterError> {
        serde_json::to_string(self).map_err(|e| RouterError::Send(e.to_string()))
    }
}

impl From<CriticalEvent> for OutboundMessage {
    fn from(event: CriticalEvent) -> Self {
        OutboundMessage::Critical(event)
    }
}

impl From<SystemMessage> for OutboundMessage {
    fn from(message: SystemMessage) -> Self {
        OutboundMessage::System(message)
    }
}

/// Client-to-server envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl InboundMessage {
    pub fn parse(raw: &str) -> Result<Self, RouterError> {
        let message: InboundMessage =
            serde_json::from_str(raw).map_err(|e| RouterError::MalformedMessage(e.to_string()))?;
        if message.message_type.trim().is_empty() {
            return Err(RouterError::MalformedMessage(
                "message type must not be empty".to_string(),
            ));
        }
        Ok(message)
    }
}
