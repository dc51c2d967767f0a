//! Transport seam between the router and a client connection.

use crate::error::RouterError;
use crate::events::OutboundMessage;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Outbound half of one client connection.
#[async_trait]
pub trait ClientSink: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<(), RouterError>;
}

/// Bounded in-process sink. The receiving half is drained by the transport
/// task that owns the socket.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<OutboundMessage>,
    send_timeout: Duration,
}

impl ChannelSink {
    pub fn new(
        capacity: usize,
        send_timeout: Duration,
    ) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, send_timeout }, rx)
    }
}

#[async_trait]
impl ClientSink for ChannelSink {
    /// Waits up to `send_timeout` for room in a full buffer.
    async fn send(&self, message: OutboundMessage) -> Result<(), RouterError> {
        self.tx
            .send_timeout(message, self.send_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => {
                    RouterError::Send("outbound buffer full".to_string())
                }
                mpsc::error::SendTimeoutError::Closed(_) => {
                    RouterError::Send("client channel closed".to_string())
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SystemMessage;
    use serde_json::Value;

    fn custom(n: u64) -> OutboundMessage {
        SystemMessage::Custom {
            event: "tick".to_string(),
            data: Value::from(n),
        }
        .into()
    }

    const WAIT: Duration = Duration::from_millis(30);

    #[tokio::test]
    async fn test_full_buffer_fails_after_wait() {
        let (sink, mut rx) = ChannelSink::new(1, WAIT);
        sink.send(custom(1)).await.unwrap();
        let err = sink.send(custom(2)).await.unwrap_err();
        assert_eq!(err, RouterError::Send("outbound buffer full".to_string()));

        assert_eq!(rx.recv().await.unwrap(), custom(1));
    }

    #[tokio::test]
    async fn test_full_buffer_waits_for_reader() {
        let (sink, mut rx) = ChannelSink::new(1, Duration::from_secs(2));
        sink.send(custom(1)).await.unwrap();

        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let first = rx.recv().await;
            let second = rx.recv().await;
            (first, second)
        });
        sink.send(custom(2)).await.unwrap();

        let (first, second) = reader.await.unwrap();
        assert_eq!(first, Some(custom(1)));
        assert_eq!(second, Some(custom(2)));
    }

    #[tokio::test]
    async fn test_closed_receiver_fails() {
        let (sink, rx) = ChannelSink::new(4, WAIT);
        drop(rx);
        assert!(sink.send(custom(1)).await.is_err());
    }
}
