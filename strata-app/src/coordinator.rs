//! Wires the context manager, timeout manager and router together.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strata_context::{TracingAuditSink, UserContextManager};
use strata_core::{
    ConfigError, ContextError, CoreConfig, Metrics, UserExecutionContext, VerifiedIdentity,
};
use strata_execution::{ExecutionError, ExecutionScope, ExecutionTimeoutManager};
use strata_router::{
    AgentCompletedPayload, AgentStartedPayload, ClientSink, ConnectOptions, ConnectionHandle,
    EventPayload, EventRouter, PingHandler, RouterError, SystemMessage,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Owns exactly one instance of each component.
pub struct Coordinator {
    config: CoreConfig,
    metrics: Arc<Metrics>,
    contexts: UserContextManager,
    executions: ExecutionTimeoutManager,
    router: EventRouter,
    /// Context key to `(run_id, user_id)`, kept so a request can be finished
    /// after its context expired.
    requests: DashMap<String, (String, String)>,
}

impl Coordinator {
    pub fn new(config: CoreConfig) -> Result<Self, CoordinatorError> {
        config.validate()?;

        let metrics = Metrics::new();
        let contexts = UserContextManager::new(
            config.context.clone(),
            Arc::clone(&metrics),
            Arc::new(TracingAuditSink),
        );
        let executions =
            ExecutionTimeoutManager::new(config.timeout.clone(), Arc::clone(&metrics))?;
        let router = EventRouter::new(config.router.clone(), Arc::clone(&metrics));
        router.register_handler(Arc::new(PingHandler))?;

        info!(
            default_timeout_secs = config.timeout.default_timeout_seconds,
            max_contexts_per_user = config.context.max_contexts_per_user,
            "Coordinator initialized"
        );

        Ok(Self {
            config,
            metrics,
            contexts,
            executions,
            router,
            requests: DashMap::new(),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn contexts(&self) -> &UserContextManager {
        &self.contexts
    }

    pub fn executions(&self) -> &ExecutionTimeoutManager {
        &self.executions
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Periodic TTL sweep, stopped when the coordinator is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.contexts.spawn_sweeper(self.config.context.sweep_interval())
    }

    /// Register the context for one request and bind its run to the client.
    /// Returns the context key.
    pub async fn start_request(
        &self,
        identity: &VerifiedIdentity,
        thread_id: &str,
        run_id: &str,
        client_id: &str,
    ) -> Result<String, CoordinatorError> {
        let context = UserExecutionContext::from_identity(identity, thread_id, run_id)?
            .with_websocket_client_id(client_id);
        let key = context.key();

        self.contexts.set_context(&key, context.clone(), None)?;
        if let Err(e) = self.router.bind_run(&context).await {
            self.contexts.clear_context(&key);
            return Err(e.into());
        }
        self.requests.insert(
            key.clone(),
            (context.run_id.clone(), context.user_id.clone()),
        );

        info!(key = %key, user_id = %context.user_id, "Request started");
        Ok(key)
    }

    /// Connect a client to the context registered under `key`.
    pub async fn connect(
        &self,
        key: &str,
        sink: Arc<dyn ClientSink>,
        options: ConnectOptions,
    ) -> Result<ConnectionHandle, CoordinatorError> {
        let context = self.contexts.get_context(key)?;
        Ok(self.router.connect(&context, sink, options).await?)
    }

    /// Run an agent for the request under `key` and report its lifecycle to
    /// the bound client.
    ///
    /// Emits `agent_started` once the breaker admits the call, then
    /// `agent_completed` with the serialized result. A timeout is reported as `run_failed` carrying partial results;
    /// an open breaker as `temporarily_unavailable`. The execution error is
    /// returned unchanged.
    pub async fn run_agent<T, E, F, Fut>(
        &self,
        key: &str,
        agent_type: &str,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T, CoordinatorError>
    where
        F: FnOnce(ExecutionScope) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        let context = self.contexts.get_context(key)?;
        let run_id = context.run_id.as_str();
        let user_id = context.user_id.as_str();

        let announce = async {
            let started = EventPayload::AgentStarted(AgentStartedPayload {
                agent_type: agent_type.to_string(),
                ..AgentStartedPayload::default()
            });
            if let Err(e) = self.router.emit(run_id, user_id, started).await {
                warn!(run_id = %run_id, error = %e, "Could not report agent start");
            }
        };

        let result = self
            .executions
            .execute_for_context_with_start(&context, agent_type, timeout, announce, operation)
            .await;

        match result {
            Ok(value) => {
                let payload = serde_json::to_value(&value).unwrap_or_else(|e| {
                    warn!(run_id = %run_id, error = %e, "Agent result is not serializable");
                    Value::Null
                });
                self.router
                    .emit(
                        run_id,
                        user_id,
                        EventPayload::AgentCompleted(AgentCompletedPayload {
                            result: payload,
                            ..AgentCompletedPayload::default()
                        }),
                    )
                    .await?;
                Ok(value)
            }
            Err(err) => {
                if let Some(signal) = failure_signal(run_id, &err) {
                    if let Err(e) = self.router.notify_run(run_id, signal).await {
                        warn!(run_id = %run_id, error = %e, "Could not signal run failure");
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Clear the request's context and release its run state.
    pub fn finish_request(&self, key: &str) -> bool {
        let cleared = self.contexts.clear_context(key);
        if let Some((_, (run_id, user_id))) = self.requests.remove(key) {
            self.router.release_run(&run_id, &user_id);
            self.executions.release_execution(&run_id, &user_id);
        }
        info!(key = %key, cleared, "Request finished");
        cleared
    }
}

fn failure_signal(run_id: &str, err: &ExecutionError) -> Option<SystemMessage> {
    match err {
        ExecutionError::Timeout(failure) => Some(SystemMessage::RunFailed {
            run_id: run_id.to_string(),
            reason: err.to_string(),
            partial_results: failure.partial_results.clone(),
        }),
        ExecutionError::CircuitOpen {
            agent_type,
            retry_after,
        } => Some(SystemMessage::TemporarilyUnavailable {
            run_id: run_id.to_string(),
            agent_type: agent_type.clone(),
            retry_after_seconds: retry_after.as_secs_f64(),
        }),
        ExecutionError::Failed { .. }
        | ExecutionError::Panicked { .. }
        | ExecutionError::Cancelled { .. } => Some(SystemMessage::RunFailed {
            run_id: run_id.to_string(),
            reason: err.to_string(),
            partial_results: Vec::new(),
        }),
        ExecutionError::AlreadyRunning(_)
        | ExecutionError::UnknownRun(_)
        | ExecutionError::NotOwner { .. }
        | ExecutionError::InvalidState(_) => None,
    }
}
