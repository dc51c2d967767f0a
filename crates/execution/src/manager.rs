//! Bounded execution of agent operations.

use crate::adaptive::AdaptiveTimeout;
use crate::circuit_breaker::{Admission, CircuitBreakerState};
use crate::error::{ExecutionError, TimeoutFailure};
use crate::scope::{CleanupHook, ExecutionScope};
use crate::tracker::{ExecutionRecord, ExecutionTracker};
use dashmap::DashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_core::{ConfigError, ExecutionState, Metrics, TimeoutConfig, UserExecutionContext};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

enum Race<T, E> {
    Joined(Result<Result<T, E>, JoinError>),
    Deadline,
    Cancelled,
}

/// Settles an admitted execution whose caller stopped polling before the
/// outcome was recorded: cancels the token, aborts the task, frees a
/// half-open trial, settles the tracked run and runs cleanup hooks detached.
struct InFlight<'a> {
    manager: &'a ExecutionTimeoutManager,
    agent_type: &'a str,
    run_id: Option<&'a str>,
    trial: bool,
    scope: ExecutionScope,
    cancel_on_drop: Option<DropGuard>,
    abort: Option<AbortHandle>,
}

impl<'a> InFlight<'a> {
    fn new(
        manager: &'a ExecutionTimeoutManager,
        agent_type: &'a str,
        run_id: Option<&'a str>,
        trial: bool,
        token: CancellationToken,
        scope: ExecutionScope,
    ) -> Self {
        Self {
            manager,
            agent_type,
            run_id,
            trial,
            scope,
            cancel_on_drop: Some(token.drop_guard()),
            abort: None,
        }
    }

    /// The caller is still here and records the outcome itself.
    fn disarm(&mut self) {
        if let Some(guard) = self.cancel_on_drop.take() {
            guard.disarm();
        }
        self.abort = None;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let Some(guard) = self.cancel_on_drop.take() else {
            return;
        };
        drop(guard);
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
        self.manager.release_trial(self.agent_type, self.trial);
        if let Some(run_id) = self.run_id {
            self.manager.tracker.abandon(run_id);
        }
        self.manager.cleanup_detached(self.agent_type, &self.scope);
        warn!(agent_type = %self.agent_type, trial = self.trial, "Caller dropped an in-flight execution");
    }
}

/// Runs operations under a deadline, a per-agent circuit breaker and an
/// adaptive timeout policy.
///
/// Each operation runs on its own task, so the deadline holds even when the
/// operation blocks a worker thread.
pub struct ExecutionTimeoutManager {
    config: TimeoutConfig,
    breakers: DashMap<String, CircuitBreakerState>,
    adaptive: DashMap<String, AdaptiveTimeout>,
    tracker: ExecutionTracker,
    metrics: Arc<Metrics>,
}

impl ExecutionTimeoutManager {
    pub fn new(config: TimeoutConfig, metrics: Arc<Metrics>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            breakers: DashMap::new(),
            adaptive: DashMap::new(),
            tracker: ExecutionTracker::new(),
            metrics,
        })
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Run `operation` for `agent_type` within a timeout.
    ///
    /// An explicit timeout is capped at the configured maximum; otherwise the
    /// agent's adaptive timeout applies. When the breaker is open the
    /// operation is never invoked.
    ///
    /// # Errors
    /// `CircuitOpen`, `Timeout` (with partial results and any cleanup
    /// failure), `Failed`, `Panicked` or `Cancelled`.
    pub async fn execute_with_timeout<T, E, F, Fut>(
        &self,
        agent_type: &str,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T, ExecutionError>
    where
        F: FnOnce(ExecutionScope) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        self.run(agent_type, timeout, None, std::future::ready(()), operation)
            .await
    }

    /// Same as [`execute_with_timeout`](Self::execute_with_timeout), tracking
    /// the run's [`ExecutionState`] under the context's run id.
    pub async fn execute_for_context<T, E, F, Fut>(
        &self,
        context: &UserExecutionContext,
        agent_type: &str,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T, ExecutionError>
    where
        F: FnOnce(ExecutionScope) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        self.execute_for_context_with_start(
            context,
            agent_type,
            timeout,
            std::future::ready(()),
            operation,
        )
        .await
    }

    /// Like [`execute_for_context`](Self::execute_for_context), awaiting
    /// `on_start` once the call has been admitted and before the operation is
    /// spawned. A call rejected by the breaker never polls `on_start`.
    pub async fn execute_for_context_with_start<T, E, F, Fut, S>(
        &self,
        context: &UserExecutionContext,
        agent_type: &str,
        timeout: Option<Duration>,
        on_start: S,
        operation: F,
    ) -> Result<T, ExecutionError>
    where
        F: FnOnce(ExecutionScope) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
        S: Future<Output = ()> + Send,
    {
        self.run(
            agent_type,
            timeout,
            Some((context.run_id.as_str(), context.user_id.as_str())),
            on_start,
            operation,
        )
        .await
    }

    async fn run<T, E, F, Fut, S>(
        &self,
        agent_type: &str,
        timeout: Option<Duration>,
        tracked: Option<(&str, &str)>,
        on_start: S,
        operation: F,
    ) -> Result<T, ExecutionError>
    where
        F: FnOnce(ExecutionScope) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
        S: Future<Output = ()> + Send,
    {
        let trial = self.admit(agent_type)?;

        let token = CancellationToken::new();
        let run_id = tracked.map(|(run_id, _)| run_id);
        if let Some((run_id, user_id)) = tracked {
            if let Err(e) = self.tracker.begin(run_id, user_id, agent_type, token.clone()) {
                self.release_trial(agent_type, trial);
                return Err(e);
            }
            self.tracker.advance(run_id, &[ExecutionState::Starting]);
        }

        let effective = self.resolve_timeout(agent_type, timeout);
        let scope = ExecutionScope::new(token.child_token(), self.config.allow_partial_results);
        let mut in_flight = InFlight::new(
            self,
            agent_type,
            run_id,
            trial,
            token.clone(),
            scope.clone(),
        );

        on_start.await;

        let started = Instant::now();
        let mut handle = tokio::spawn(operation(scope.clone()));
        in_flight.abort = Some(handle.abort_handle());
        if let Some(run_id) = run_id {
            self.tracker.attach_abort(run_id, handle.abort_handle());
            self.tracker.advance(run_id, &[ExecutionState::Running]);
        }
        self.metrics.inc_executions_started();
        debug!(
            agent_type = %agent_type,
            timeout_secs = effective.as_secs_f64(),
            trial,
            "Execution started"
        );

        let race = tokio::select! {
            biased;
            joined = &mut handle => Race::Joined(joined),
            _ = tokio::time::sleep(effective) => Race::Deadline,
            _ = token.cancelled() => Race::Cancelled,
        };
        let elapsed = started.elapsed();
        in_flight.disarm();

        match race {
            Race::Joined(Ok(Ok(value))) => {
                self.record_success(agent_type, elapsed, effective, trial);
                if let Some(run_id) = run_id {
                    self.tracker.advance(
                        run_id,
                        &[ExecutionState::Completing, ExecutionState::Completed],
                    );
                }
                self.metrics.inc_executions_succeeded();
                debug!(agent_type = %agent_type, elapsed_ms = elapsed.as_millis() as u64, "Execution completed");
                Ok(value)
            }
            Race::Joined(Ok(Err(e))) => {
                let message = e.to_string();
                self.record_failure(agent_type, elapsed, effective, false, trial);
                if let Some(run_id) = run_id {
                    self.tracker.advance(run_id, &[ExecutionState::Failed]);
                }
                self.metrics.inc_executions_failed();
                warn!(agent_type = %agent_type, error = %message, "Execution failed");
                Err(ExecutionError::Failed {
                    agent_type: agent_type.to_string(),
                    message,
                })
            }
            Race::Joined(Err(join_err)) if join_err.is_panic() => {
                self.record_failure(agent_type, elapsed, effective, false, trial);
                if let Some(run_id) = run_id {
                    self.tracker.advance(run_id, &[ExecutionState::Failed]);
                }
                self.metrics.inc_executions_failed();
                error!(agent_type = %agent_type, "Execution panicked");
                Err(ExecutionError::Panicked {
                    agent_type: agent_type.to_string(),
                })
            }
            Race::Joined(Err(_)) | Race::Cancelled => {
                handle.abort();
                self.release_trial(agent_type, trial);
                if let Some(run_id) = run_id {
                    self.tracker.advance(run_id, &[ExecutionState::Cancelled]);
                }
                if let Some(e) = self.run_cleanup(&scope).await {
                    warn!(agent_type = %agent_type, error = %e, "Cleanup after cancellation failed");
                }
                info!(agent_type = %agent_type, "Execution cancelled");
                Err(ExecutionError::Cancelled {
                    agent_type: agent_type.to_string(),
                })
            }
            Race::Deadline => {
                token.cancel();
                handle.abort();
                self.watch_unwind(agent_type, handle);

                self.record_failure(agent_type, elapsed, effective, true, trial);
                if let Some(run_id) = run_id {
                    self.tracker.advance(run_id, &[ExecutionState::Timeout]);
                }
                self.metrics.inc_executions_timed_out();

                let cleanup_error = self.run_cleanup(&scope).await;
                if let Some(e) = &cleanup_error {
                    warn!(agent_type = %agent_type, error = %e, "Cleanup after timeout failed");
                }
                let partial_results = scope.take_partials();
                warn!(
                    agent_type = %agent_type,
                    timeout_secs = effective.as_secs_f64(),
                    partial_results = partial_results.len(),
                    cleanup_failed = cleanup_error.is_some(),
                    "Execution timed out"
                );
                Err(ExecutionError::Timeout(TimeoutFailure {
                    agent_type: agent_type.to_string(),
                    timeout: effective,
                    elapsed,
                    partial_results,
                    cleanup_error,
                }))
            }
        }
    }

    /// Timeout the next call for `agent_type` would get without an explicit one.
    pub fn effective_timeout(&self, agent_type: &str) -> Duration {
        self.resolve_timeout(agent_type, None)
    }

    /// Recent execution durations for `agent_type`, oldest first.
    pub fn duration_history(&self, agent_type: &str) -> Vec<Duration> {
        self.adaptive
            .get(agent_type)
            .map(|adaptive| adaptive.history())
            .unwrap_or_default()
    }

    pub fn circuit_state(&self, agent_type: &str) -> CircuitBreakerState {
        self.breakers
            .get(agent_type)
            .map(|breaker| breaker.value().clone())
            .unwrap_or_default()
    }

    pub fn reset_circuit(&self, agent_type: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(agent_type) {
            breaker.reset();
            info!(agent_type = %agent_type, "Circuit breaker reset");
        }
    }

    pub fn tracker(&self) -> &ExecutionTracker {
        &self.tracker
    }

    pub fn execution_state(&self, run_id: &str) -> Option<ExecutionState> {
        self.tracker.state(run_id)
    }

    pub fn execution_record(&self, run_id: &str) -> Option<ExecutionRecord> {
        self.tracker.record(run_id)
    }

    /// Cooperatively cancel `user_id`'s run. `Ok(false)` when it already finished.
    pub fn cancel_execution(&self, run_id: &str, user_id: &str) -> Result<bool, ExecutionError> {
        self.tracker.cancel(run_id, user_id)
    }

    pub fn force_kill(&self, run_id: &str, user_id: &str) -> Result<ExecutionState, ExecutionError> {
        self.tracker.force_kill(run_id, user_id)
    }

    pub fn release_execution(&self, run_id: &str, user_id: &str) -> bool {
        self.tracker.release(run_id, user_id)
    }

    fn resolve_timeout(&self, agent_type: &str, explicit: Option<Duration>) -> Duration {
        let max = self.config.max_timeout();
        match explicit {
            Some(timeout) => timeout.min(max),
            None if self.config.adaptive_timeout_enabled => self
                .adaptive
                .get(agent_type)
                .map(|adaptive| adaptive.current())
                .unwrap_or_else(|| self.config.default_timeout())
                .min(max),
            None => self.config.default_timeout().min(max),
        }
    }

    fn admit(&self, agent_type: &str) -> Result<bool, ExecutionError> {
        let admission = self
            .breakers
            .entry(agent_type.to_string())
            .or_default()
            .try_admit(Instant::now(), self.config.recovery_timeout());

        match admission {
            Admission::Allowed { trial } => {
                if trial {
                    info!(agent_type = %agent_type, "Circuit breaker half-open, admitting trial call");
                }
                Ok(trial)
            }
            Admission::Rejected { retry_after } => {
                self.metrics.inc_breaker_rejections();
                debug!(agent_type = %agent_type, "Rejected by open circuit breaker");
                Err(ExecutionError::CircuitOpen {
                    agent_type: agent_type.to_string(),
                    retry_after,
                })
            }
        }
    }

    fn release_trial(&self, agent_type: &str, trial: bool) {
        if trial {
            if let Some(mut breaker) = self.breakers.get_mut(agent_type) {
                breaker.release_trial();
            }
        }
    }

    fn record_success(&self, agent_type: &str, elapsed: Duration, used: Duration, trial: bool) {
        if let Some(mut breaker) = self.breakers.get_mut(agent_type) {
            breaker.record_success(trial);
        }
        self.adapt(agent_type, elapsed, used, false);
    }

    fn record_failure(
        &self,
        agent_type: &str,
        elapsed: Duration,
        used: Duration,
        timed_out: bool,
        trial: bool,
    ) {
        let opened = self
            .breakers
            .entry(agent_type.to_string())
            .or_default()
            .record_failure(
                Instant::now(),
                self.config.circuit_breaker_failure_threshold,
                trial,
            );
        if opened {
            warn!(
                agent_type = %agent_type,
                recovery_secs = self.config.circuit_breaker_recovery_timeout,
                "Circuit breaker opened"
            );
        }
        self.adapt(agent_type, elapsed, used, timed_out);
    }

    fn adapt(&self, agent_type: &str, elapsed: Duration, used: Duration, timed_out: bool) {
        let default = self.config.default_timeout();
        let factor = if self.config.adaptive_timeout_enabled {
            self.config.timeout_adjustment_factor
        } else {
            1.0
        };

        let mut adaptive = self
            .adaptive
            .entry(agent_type.to_string())
            .or_insert_with(|| AdaptiveTimeout::new(default));
        let before = adaptive.current();
        let after = adaptive.record(elapsed, used, timed_out, default, self.config.max_timeout(), factor);
        if after > before {
            info!(
                agent_type = %agent_type,
                from_secs = before.as_secs_f64(),
                to_secs = after.as_secs_f64(),
                "Raised adaptive timeout"
            );
        }
    }

    /// Bound how long an aborted operation may take to unwind.
    fn watch_unwind<T: Send + 'static>(&self, agent_type: &str, handle: JoinHandle<T>) {
        let cleanup_timeout = self.config.cleanup_timeout();
        let metrics = Arc::clone(&self.metrics);
        let agent_type = agent_type.to_string();
        tokio::spawn(async move {
            if tokio::time::timeout(cleanup_timeout, handle).await.is_err() {
                metrics.inc_cleanup_failures();
                warn!(
                    agent_type = %agent_type,
                    cleanup_secs = cleanup_timeout.as_secs_f64(),
                    "Timed-out operation did not unwind in time"
                );
            }
        });
    }

    /// Run registered cleanup hooks within one cleanup window. Returns the
    /// combined failure message, if any.
    async fn run_cleanup(&self, scope: &ExecutionScope) -> Option<String> {
        let failure = run_cleanup_hooks(scope.take_cleanups(), self.config.cleanup_timeout()).await;
        if failure.is_some() {
            self.metrics.inc_cleanup_failures();
        }
        failure
    }

    /// Cleanup for an execution nobody awaits any more.
    fn cleanup_detached(&self, agent_type: &str, scope: &ExecutionScope) {
        let hooks = scope.take_cleanups();
        if hooks.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(agent_type = %agent_type, hooks = hooks.len(), "No runtime left for cleanup");
            return;
        };
        let cleanup_timeout = self.config.cleanup_timeout();
        let metrics = Arc::clone(&self.metrics);
        let agent_type = agent_type.to_string();
        runtime.spawn(async move {
            if let Some(e) = run_cleanup_hooks(hooks, cleanup_timeout).await {
                metrics.inc_cleanup_failures();
                warn!(agent_type = %agent_type, error = %e, "Cleanup after dropped execution failed");
            }
        });
    }
}

async fn run_cleanup_hooks(hooks: Vec<CleanupHook>, cleanup_timeout: Duration) -> Option<String> {
    let deadline = tokio::time::Instant::now() + cleanup_timeout;
    let mut failures = Vec::new();

    for hook in hooks {
        match tokio::time::timeout_at(deadline, hook()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failures.push(e),
            Err(_) => failures.push(format!(
                "cleanup exceeded {:.2}s",
                cleanup_timeout.as_secs_f64()
            )),
        }
    }

    if failures.is_empty() {
        None
    } else {
        Some(failures.join("; "))
    }
}
