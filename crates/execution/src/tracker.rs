//! Per-run execution state tracking.

use crate::error::ExecutionError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use strata_core::ExecutionState;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub run_id: String,
    pub user_id: String,
    pub agent_type: String,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct TrackedRun {
    record: ExecutionRecord,
    token: CancellationToken,
    abort: Option<AbortHandle>,
}

/// Lifecycle of each run, keyed by run id.
#[derive(Default)]
pub struct ExecutionTracker {
    runs: DashMap<String, TrackedRun>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a run in `Pending`. A terminal record for the same run
    /// is replaced; a live one is an error.
    pub(crate) fn begin(
        &self,
        run_id: &str,
        user_id: &str,
        agent_type: &str,
        token: CancellationToken,
    ) -> Result<(), ExecutionError> {
        let now = Utc::now();
        let tracked = TrackedRun {
            record: ExecutionRecord {
                run_id: run_id.to_string(),
                user_id: user_id.to_string(),
                agent_type: agent_type.to_string(),
                state: ExecutionState::Pending,
                started_at: now,
                updated_at: now,
            },
            token,
            abort: None,
        };

        match self.runs.entry(run_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if !occupied.get().record.state.is_terminal() {
                    return Err(ExecutionError::AlreadyRunning(run_id.to_string()));
                }
                occupied.insert(tracked);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(tracked);
            }
        }
        Ok(())
    }

    pub(crate) fn attach_abort(&self, run_id: &str, abort: AbortHandle) {
        if let Some(mut run) = self.runs.get_mut(run_id) {
            run.abort = Some(abort);
        }
    }

    pub(crate) fn transition(
        &self,
        run_id: &str,
        next: ExecutionState,
    ) -> Result<ExecutionState, ExecutionError> {
        let mut run = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ExecutionError::UnknownRun(run_id.to_string()))?;
        let state = run.record.state.transition(next)?;
        run.record.state = state;
        run.record.updated_at = Utc::now();
        if state.is_terminal() {
            run.abort = None;
        }
        debug!(run_id = %run_id, state = %state, "Execution state changed");
        Ok(state)
    }

    /// Walk through `states` in order, stopping at the first rejected edge.
    /// A run force-killed meanwhile stays `Dead`.
    pub(crate) fn advance(&self, run_id: &str, states: &[ExecutionState]) {
        for &next in states {
            if let Err(e) = self.transition(run_id, next) {
                debug!(run_id = %run_id, error = %e, "Skipped execution state change");
                return;
            }
        }
    }

    pub fn state(&self, run_id: &str) -> Option<ExecutionState> {
        self.runs.get(run_id).map(|run| run.record.state)
    }

    pub fn record(&self, run_id: &str) -> Option<ExecutionRecord> {
        self.runs.get(run_id).map(|run| run.record.clone())
    }

    pub fn active_runs(&self) -> Vec<ExecutionRecord> {
        self.runs
            .iter()
            .filter(|run| !run.record.state.is_terminal())
            .map(|run| run.record.clone())
            .collect()
    }

    /// Request cooperative cancellation of `user_id`'s run. The executing call
    /// observes it and moves the run to `Cancelled`. Returns false when the run
    /// already finished.
    pub fn cancel(&self, run_id: &str, user_id: &str) -> Result<bool, ExecutionError> {
        let run = self
            .runs
            .get(run_id)
            .ok_or_else(|| ExecutionError::UnknownRun(run_id.to_string()))?;
        check_owner(&run.record, user_id)?;
        if run.record.state.is_terminal() {
            return Ok(false);
        }
        run.token.cancel();
        info!(run_id = %run_id, user_id = %user_id, "Cancellation requested");
        Ok(true)
    }

    /// Mark `user_id`'s run `Dead` and abort its task without waiting for it.
    pub fn force_kill(&self, run_id: &str, user_id: &str) -> Result<ExecutionState, ExecutionError> {
        let (token, abort) = {
            let mut run = self
                .runs
                .get_mut(run_id)
                .ok_or_else(|| ExecutionError::UnknownRun(run_id.to_string()))?;
            check_owner(&run.record, user_id)?;
            let state = run.record.state.transition(ExecutionState::Dead)?;
            run.record.state = state;
            run.record.updated_at = Utc::now();
            (run.token.clone(), run.abort.take())
        };

        token.cancel();
        if let Some(abort) = abort {
            abort.abort();
        }
        warn!(run_id = %run_id, user_id = %user_id, "Execution force-killed");
        Ok(ExecutionState::Dead)
    }

    /// Settle a run whose caller went away: `Cancelled` once it was running,
    /// `Dead` before that.
    pub(crate) fn abandon(&self, run_id: &str) {
        let next = match self.state(run_id) {
            Some(ExecutionState::Running) => ExecutionState::Cancelled,
            Some(state) if !state.is_terminal() => ExecutionState::Dead,
            _ => return,
        };
        if let Err(e) = self.transition(run_id, next) {
            debug!(run_id = %run_id, error = %e, "Abandoned run already settled");
        }
    }

    /// Forget a finished run owned by `user_id`. Live runs are kept.
    pub fn release(&self, run_id: &str, user_id: &str) -> bool {
        self.runs
            .remove_if(run_id, |_, run| {
                run.record.user_id == user_id && run.record.state.is_terminal()
            })
            .is_some()
    }
}

fn check_owner(record: &ExecutionRecord, user_id: &str) -> Result<(), ExecutionError> {
    if record.user_id == user_id {
        Ok(())
    } else {
        Err(ExecutionError::NotOwner {
            run_id: record.run_id.clone(),
            user_id: user_id.to_string(),
        })
    }
}
