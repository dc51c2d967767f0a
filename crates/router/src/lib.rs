//! Connection and critical event routing.

pub mod error;
pub mod events;
pub mod handler;
pub mod router;
pub mod sink;

pub use error::RouterError;
pub use events::{
    AgentCompletedPayload, AgentStartedPayload, AgentThinkingPayload, CriticalEvent,
    CriticalEventKind, ErrorCode, EventPayload, InboundMessage, OutboundMessage, SystemMessage,
    ToolCompletedPayload, ToolExecutingPayload,
};
pub use handler::{MessageHandler, PingHandler};
pub use router::{BroadcastReport, ConnectOptions, ConnectionHandle, EmitOutcome, EventRouter};
pub use sink::{ChannelSink, ClientSink};
