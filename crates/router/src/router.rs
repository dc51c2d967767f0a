//! The canonical connection and event router.

use crate::error::RouterError;
use crate::events::{
    CriticalEvent, CriticalEventKind, EventPayload, InboundMessage, OutboundMessage, SystemMessage,
};
use crate::handler::MessageHandler;
use crate::sink::{ChannelSink, ClientSink};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use strata_core::{Metrics, RouterConfig, UserExecutionContext};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifies one live client connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    pub user_id: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Replay critical events the client already received for its runs.
    pub resume: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Delivered,
    /// Client not reachable; held until it reconnects.
    Buffered,
    /// Kind already emitted for this run; nothing sent.
    Duplicate,
    /// Run already completed; nothing sent.
    RunClosed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<Uuid>,
}

type ClientKey = (String, String);

struct Connection {
    connection_id: Uuid,
    sink: Arc<dyn ClientSink>,
}

struct RunState {
    client_id: String,
    emitted: HashSet<CriticalEventKind>,
    delivered: VecDeque<OutboundMessage>,
    pending: VecDeque<OutboundMessage>,
    closed: bool,
}

struct RunSlot {
    user_id: String,
    state: Mutex<RunState>,
}

impl RunSlot {
    fn new(user_id: String, client_id: String) -> Self {
        Self {
            user_id,
            state: Mutex::new(RunState {
                client_id,
                emitted: HashSet::new(),
                delivered: VecDeque::new(),
                pending: VecDeque::new(),
                closed: false,
            }),
        }
    }
}

/// Routes inbound messages and delivers outbound ones.
///
/// Delivery always resolves the target through a run's `(user_id, client_id)`
/// binding. Each run has its own async lock, held from the dedup check through
/// the send, so emission order and delivery order match.
pub struct EventRouter {
    config: RouterConfig,
    connections: DashMap<ClientKey, Connection>,
    runs: DashMap<String, Arc<RunSlot>>,
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    metrics: Arc<Metrics>,
}

impl EventRouter {
    pub fn new(config: RouterConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            connections: DashMap::new(),
            runs: DashMap::new(),
            handlers: DashMap::new(),
            metrics,
        }
    }

    /// Register the single handler for a message type.
    pub fn register_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<(), RouterError> {
        let message_type = handler.message_type().to_string();
        match self.handlers.entry(message_type.clone()) {
            Entry::Occupied(_) => Err(RouterError::DuplicateHandler(message_type)),
            Entry::Vacant(vacant) => {
                vacant.insert(handler);
                debug!(message_type = %message_type, "Registered message handler");
                Ok(())
            }
        }
    }

    /// Sink sized by the configured outbound buffer.
    pub fn channel_sink(&self) -> (ChannelSink, mpsc::Receiver<OutboundMessage>) {
        ChannelSink::new(self.config.outbound_buffer, self.config.send_timeout())
    }

    /// Accept a connection for the context's `(user_id, websocket_client_id)`.
    ///
    /// Replaces any earlier connection for the same pair, whose handle becomes
    /// stale. Events buffered for the client's runs are flushed; already
    /// delivered ones are replayed only with `resume`.
    pub async fn connect(
        &self,
        context: &UserExecutionContext,
        sink: Arc<dyn ClientSink>,
        options: ConnectOptions,
    ) -> Result<ConnectionHandle, RouterError> {
        let client_id = client_binding(context)?;
        self.bind_run(context).await?;

        let handle = ConnectionHandle {
            connection_id: Uuid::new_v4(),
            user_id: context.user_id.clone(),
            client_id,
        };
        sink.send(
            SystemMessage::Connected {
                connection_id: handle.connection_id.to_string(),
                user_id: handle.user_id.clone(),
                client_id: handle.client_id.clone(),
                resumed: options.resume,
            }
            .into(),
        )
        .await?;

        let replaced = self.connections.insert(
            (handle.user_id.clone(), handle.client_id.clone()),
            Connection {
                connection_id: handle.connection_id,
                sink,
            },
        );
        info!(
            user_id = %handle.user_id,
            client_id = %handle.client_id,
            connection_id = %handle.connection_id,
            replaced = replaced.is_some(),
            resume = options.resume,
            "Client connected"
        );

        self.flush_client(&handle, options.resume).await;
        Ok(handle)
    }

    /// Unbind a connection. Handles replaced by a newer connection are ignored.
    pub fn disconnect(&self, handle: &ConnectionHandle) -> bool {
        let key = (handle.user_id.clone(), handle.client_id.clone());
        let removed = self
            .connections
            .remove_if(&key, |_, connection| connection.connection_id == handle.connection_id)
            .is_some();
        if removed {
            info!(
                user_id = %handle.user_id,
                client_id = %handle.client_id,
                connection_id = %handle.connection_id,
                "Client disconnected"
            );
        } else {
            debug!(connection_id = %handle.connection_id, "Ignoring disconnect of stale handle");
        }
        removed
    }

    /// Bind the context's run to its user and client.
    ///
    /// A run stays owned by the user that first bound it; binding it again
    /// from the same user may move it to a new client id.
    pub async fn bind_run(&self, context: &UserExecutionContext) -> Result<(), RouterError> {
        let client_id = client_binding(context)?;

        let existing = match self.runs.entry(context.run_id.clone()) {
            Entry::Occupied(occupied) => {
                if occupied.get().user_id != context.user_id {
                    warn!(
                        run_id = %context.run_id,
                        user_id = %context.user_id,
                        "Rejected binding of another user's run"
                    );
                    return Err(RouterError::Isolation(format!(
                        "run {} is bound to a different user",
                        context.run_id
                    )));
                }
                Some(Arc::clone(occupied.get()))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(RunSlot::new(
                    context.user_id.clone(),
                    client_id.clone(),
                )));
                None
            }
        };

        if let Some(slot) = existing {
            slot.state.lock().await.client_id = client_id;
        }
        Ok(())
    }

    /// Forget `user_id`'s run: its dedup set and buffers.
    pub fn release_run(&self, run_id: &str, user_id: &str) -> bool {
        self.runs
            .remove_if(run_id, |_, slot| slot.user_id == user_id)
            .is_some()
    }

    pub fn is_run_bound(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }

    /// Emit one of the five critical events for a run, at most once per kind.
    pub async fn emit_critical_event(
        &self,
        run_id: &str,
        user_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<EmitOutcome, RouterError> {
        let kind: CriticalEventKind = event_type.parse()?;
        let payload = EventPayload::parse(kind, payload)?;
        self.emit(run_id, user_id, payload).await
    }

    /// Typed form of [`emit_critical_event`](Self::emit_critical_event).
    pub async fn emit(
        &self,
        run_id: &str,
        user_id: &str,
        payload: EventPayload,
    ) -> Result<EmitOutcome, RouterError> {
        let kind = payload.kind();
        let slot = self.run_slot(run_id)?;
        if slot.user_id != user_id {
            warn!(run_id = %run_id, user_id = %user_id, "Rejected emission for another user's run");
            return Err(RouterError::Isolation(format!(
                "run {run_id} does not belong to user {user_id}"
            )));
        }

        let mut state = slot.state.lock().await;
        if state.emitted.contains(&kind) {
            warn!(run_id = %run_id, event_type = kind.as_str(), "Duplicate critical event suppressed");
            self.metrics.inc_events_deduplicated();
            return Ok(EmitOutcome::Duplicate);
        }
        if state.closed {
            warn!(run_id = %run_id, event_type = kind.as_str(), "Critical event after completion dropped");
            return Ok(EmitOutcome::RunClosed);
        }

        state.emitted.insert(kind);
        if kind.is_terminal() {
            state.closed = true;
        }
        let event = CriticalEvent::new(run_id, user_id, payload);
        let outcome = self.deliver(&slot.user_id, &mut state, event.into()).await;
        debug!(run_id = %run_id, event_type = kind.as_str(), outcome = ?outcome, "Critical event emitted");
        Ok(outcome)
    }

    /// Send a run-level system signal (failure, unavailability) to the run's client.
    pub async fn notify_run(
        &self,
        run_id: &str,
        message: SystemMessage,
    ) -> Result<EmitOutcome, RouterError> {
        let slot = self.run_slot(run_id)?;
        let mut state = slot.state.lock().await;
        Ok(self.deliver(&slot.user_id, &mut state, message.into()).await)
    }

    /// Send to every connection. A failed send is reported, never fatal.
    pub async fn broadcast(&self, message: SystemMessage) -> BroadcastReport {
        let targets: Vec<_> = self
            .connections
            .iter()
            .map(|entry| (entry.connection_id, Arc::clone(&entry.sink)))
            .collect();
        self.fan_out(targets, message.into()).await
    }

    pub async fn broadcast_to_user(&self, user_id: &str, message: SystemMessage) -> BroadcastReport {
        let targets: Vec<_> = self
            .connections
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .map(|entry| (entry.connection_id, Arc::clone(&entry.sink)))
            .collect();
        self.fan_out(targets, message.into()).await
    }

    /// Parse and dispatch a raw inbound frame. Every failure is answered with
    /// a structured `error` message before it is returned.
    pub async fn route_message(
        &self,
        connection: &ConnectionHandle,
        raw: &str,
    ) -> Result<(), RouterError> {
        self.current_sink(connection)?;
        let message = match InboundMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                self.reject(connection, &e, None).await;
                return Err(e);
            }
        };
        self.dispatch(connection, message).await
    }

    pub async fn route_inbound(
        &self,
        connection: &ConnectionHandle,
        message: InboundMessage,
    ) -> Result<(), RouterError> {
        self.current_sink(connection)?;
        self.dispatch(connection, message).await
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_connected(&self, user_id: &str, client_id: &str) -> bool {
        self.connections
            .contains_key(&(user_id.to_string(), client_id.to_string()))
    }

    async fn dispatch(
        &self,
        connection: &ConnectionHandle,
        message: InboundMessage,
    ) -> Result<(), RouterError> {
        let handler = self
            .handlers
            .get(&message.message_type)
            .map(|entry| Arc::clone(entry.value()));

        let Some(handler) = handler else {
            let err = RouterError::UnknownMessageType(message.message_type.clone());
            warn!(
                user_id = %connection.user_id,
                message_type = %message.message_type,
                "No handler for inbound message"
            );
            self.reject(connection, &err, Some(&message)).await;
            return Err(err);
        };

        match handler.handle(connection, &message).await {
            Ok(reply) => {
                self.metrics.inc_messages_routed();
                if let Some(reply) = reply {
                    self.current_sink(connection)?.send(reply).await?;
                }
                Ok(())
            }
            Err(e) => {
                warn!(
                    user_id = %connection.user_id,
                    message_type = %message.message_type,
                    error = %e,
                    "Message handler failed"
                );
                self.reject(connection, &e, Some(&message)).await;
                Err(e)
            }
        }
    }

    async fn reject(
        &self,
        connection: &ConnectionHandle,
        err: &RouterError,
        message: Option<&InboundMessage>,
    ) {
        self.metrics.inc_routing_errors();
        let response = SystemMessage::Error {
            code: err.code(),
            message: err.to_string(),
            request_type: message.map(|m| m.message_type.clone()),
            request_id: message.and_then(|m| m.request_id.clone()),
        };
        let sent = match self.current_sink(connection) {
            Ok(sink) => sink.send(response.into()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            debug!(connection_id = %connection.connection_id, error = %e, "Could not deliver error response");
        }
    }

    fn current_sink(&self, connection: &ConnectionHandle) -> Result<Arc<dyn ClientSink>, RouterError> {
        let key = (connection.user_id.clone(), connection.client_id.clone());
        match self.connections.get(&key) {
            Some(current) if current.connection_id == connection.connection_id => {
                Ok(Arc::clone(&current.sink))
            }
            Some(_) => Err(RouterError::StaleConnection(connection.connection_id)),
            None => Err(RouterError::NotConnected {
                user_id: connection.user_id.clone(),
                client_id: connection.client_id.clone(),
            }),
        }
    }

    fn run_slot(&self, run_id: &str) -> Result<Arc<RunSlot>, RouterError> {
        self.runs
            .get(run_id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| RouterError::RunNotBound(run_id.to_string()))
    }

    async fn send_to(
        &self,
        user_id: &str,
        client_id: &str,
        message: OutboundMessage,
    ) -> Result<(), RouterError> {
        let sink = self
            .connections
            .get(&(user_id.to_string(), client_id.to_string()))
            .map(|connection| Arc::clone(&connection.sink))
            .ok_or_else(|| RouterError::NotConnected {
                user_id: user_id.to_string(),
                client_id: client_id.to_string(),
            })?;
        sink.send(message).await
    }

    async fn deliver(
        &self,
        user_id: &str,
        state: &mut RunState,
        message: OutboundMessage,
    ) -> EmitOutcome {
        if !self.flush_pending(user_id, state).await {
            state.pending.push_back(message);
            self.metrics.inc_events_buffered();
            return EmitOutcome::Buffered;
        }

        let sent = self.send_to(user_id, &state.client_id, message.clone()).await;
        match sent {
            Ok(()) => {
                self.record_delivered(state, message);
                EmitOutcome::Delivered
            }
            Err(e) => {
                debug!(user_id = %user_id, client_id = %state.client_id, error = %e, "Client unreachable, buffering");
                state.pending.push_back(message);
                self.metrics.inc_events_buffered();
                EmitOutcome::Buffered
            }
        }
    }

    /// Returns true once nothing is left pending.
    async fn flush_pending(&self, user_id: &str, state: &mut RunState) -> bool {
        while let Some(message) = state.pending.pop_front() {
            let sent = self.send_to(user_id, &state.client_id, message.clone()).await;
            if let Err(e) = sent {
                debug!(user_id = %user_id, error = %e, "Pending flush interrupted");
                state.pending.push_front(message);
                return false;
            }
            self.record_delivered(state, message);
        }
        true
    }

    fn record_delivered(&self, state: &mut RunState, message: OutboundMessage) {
        if message.as_critical().is_some() {
            self.metrics.inc_events_delivered();
        }
        if self.config.replay_history_limit == 0 {
            return;
        }
        if state.delivered.len() == self.config.replay_history_limit {
            state.delivered.pop_front();
        }
        state.delivered.push_back(message);
    }

    async fn flush_client(&self, handle: &ConnectionHandle, resume: bool) {
        let slots: Vec<Arc<RunSlot>> = self
            .runs
            .iter()
            .filter(|entry| entry.user_id == handle.user_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for slot in slots {
            let mut state = slot.state.lock().await;
            if state.client_id != handle.client_id {
                continue;
            }
            if resume {
                let history: Vec<OutboundMessage> = state.delivered.iter().cloned().collect();
                for message in history {
                    if let Err(e) = self.send_to(&slot.user_id, &handle.client_id, message).await {
                        warn!(user_id = %slot.user_id, error = %e, "Replay interrupted");
                        break;
                    }
                }
            }
            self.flush_pending(&slot.user_id, &mut state).await;
        }
    }

    async fn fan_out(
        &self,
        targets: Vec<(Uuid, Arc<dyn ClientSink>)>,
        message: OutboundMessage,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (connection_id, sink) in targets {
            match sink.send(message.clone()).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "Broadcast send failed");
                    self.metrics.inc_broadcast_failures();
                    report.failed.push(connection_id);
                }
            }
        }
        report
    }
}

fn client_binding(context: &UserExecutionContext) -> Result<String, RouterError> {
    context.validate()?;
    context
        .websocket_client_id
        .clone()
        .filter(|client_id| !client_id.trim().is_empty())
        .ok_or_else(|| RouterError::MissingClientBinding(context.user_id.clone()))
}
