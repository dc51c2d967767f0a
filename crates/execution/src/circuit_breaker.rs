//! Per-agent-type circuit breaker.

use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { trial: bool },
    Rejected { retry_after: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub status: BreakerStatus,
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerState {
    pub fn new() -> Self {
        Self {
            status: BreakerStatus::Closed,
            failure_count: 0,
            last_failure_time: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    /// Decide whether a call may proceed.
    ///
    /// Once the recovery window has elapsed an open breaker turns half-open
    /// and admits exactly one trial call; everything else is rejected until
    /// that trial reports back.
    pub fn try_admit(&mut self, now: Instant, recovery: Duration) -> Admission {
        match self.status {
            BreakerStatus::Closed => Admission::Allowed { trial: false },
            BreakerStatus::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= recovery {
                    self.status = BreakerStatus::HalfOpen;
                    self.trial_in_flight = true;
                    Admission::Allowed { trial: true }
                } else {
                    Admission::Rejected {
                        retry_after: recovery - elapsed,
                    }
                }
            }
            BreakerStatus::HalfOpen => {
                if self.trial_in_flight {
                    Admission::Rejected {
                        retry_after: Duration::ZERO,
                    }
                } else {
                    self.trial_in_flight = true;
                    Admission::Allowed { trial: true }
                }
            }
        }
    }

    /// Count a success. Only the half-open trial, or any call while closed,
    /// may reset the breaker; a late success from a call admitted before the
    /// breaker opened leaves it open.
    pub fn record_success(&mut self, trial: bool) {
        match self.status {
            BreakerStatus::Closed => self.failure_count = 0,
            BreakerStatus::HalfOpen if trial => self.reset(),
            BreakerStatus::HalfOpen | BreakerStatus::Open => {}
        }
    }

    /// Count a failure. Returns true when this failure opened the breaker.
    ///
    /// While half-open only the trial's verdict reopens the breaker.
    pub fn record_failure(&mut self, now: Instant, threshold: u32, trial: bool) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);

        let should_open = match self.status {
            BreakerStatus::HalfOpen => trial,
            BreakerStatus::Closed => self.failure_count >= threshold,
            BreakerStatus::Open => false,
        };
        if trial {
            self.trial_in_flight = false;
        }
        if should_open {
            self.status = BreakerStatus::Open;
            self.opened_at = Some(now);
        }
        should_open
    }

    pub fn reset(&mut self) {
        self.status = BreakerStatus::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    /// A trial that ended without a verdict (caller cancellation) frees the slot.
    pub fn release_trial(&mut self) {
        self.trial_in_flight = false;
    }
}
