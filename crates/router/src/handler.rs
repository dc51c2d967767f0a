//! Inbound message handlers.

use crate::error::RouterError;
use crate::events::{InboundMessage, OutboundMessage, SystemMessage};
use crate::router::ConnectionHandle;
use async_trait::async_trait;
use chrono::Utc;

/// Handles every inbound message of one type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn message_type(&self) -> &str;

    /// Returns the reply for the sending connection, if any.
    async fn handle(
        &self,
        connection: &ConnectionHandle,
        message: &InboundMessage,
    ) -> Result<Option<OutboundMessage>, RouterError>;
}

/// Answers `ping` with `pong`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    fn message_type(&self) -> &str {
        "ping"
    }

    async fn handle(
        &self,
        _connection: &ConnectionHandle,
        message: &InboundMessage,
    ) -> Result<Option<OutboundMessage>, RouterError> {
        Ok(Some(
            SystemMessage::Pong {
                request_id: message.request_id.clone(),
                timestamp: Utc::now(),
            }
            .into(),
        ))
    }
}
