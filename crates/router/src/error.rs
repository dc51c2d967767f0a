use crate::events::ErrorCode;
use strata_core::ContextError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown critical event type: {0}")]
    UnknownEventType(String),

    #[error("Invalid payload for '{event_type}': {reason}")]
    InvalidPayload { event_type: String, reason: String },

    #[error("Run not bound: {0}")]
    RunNotBound(String),

    #[error("Isolation violation: {0}")]
    Isolation(String),

    #[error("Client not connected: {user_id}/{client_id}")]
    NotConnected { user_id: String, client_id: String },

    #[error("Stale connection handle: {0}")]
    StaleConnection(Uuid),

    #[error("Context for user '{0}' has no websocket client binding")]
    MissingClientBinding(String),

    #[error("Handler already registered for message type: {0}")]
    DuplicateHandler(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl RouterError {
    /// Code reported to the client when this error answers an inbound message.
    pub fn code(&self) -> ErrorCode {
        match self {
            RouterError::UnknownMessageType(_) => ErrorCode::UnknownMessageType,
            RouterError::MalformedMessage(_) => ErrorCode::MalformedMessage,
            _ => ErrorCode::HandlerError,
        }
    }
}
