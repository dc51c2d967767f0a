//! Adaptive timeout policy.

use std::collections::VecDeque;
use std::time::Duration;

pub const HISTORY_LIMIT: usize = 32;

/// A run that used at least this share of its timeout counts as "near the deadline".
const NEAR_DEADLINE_RATIO: f64 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveTimeout {
    current: Duration,
    history: VecDeque<Duration>,
}

impl AdaptiveTimeout {
    pub fn new(default: Duration) -> Self {
        Self {
            current: default,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn history(&self) -> Vec<Duration> {
        self.history.iter().copied().collect()
    }

    /// Record one run and return the timeout for the next one.
    ///
    /// Grows to `max(default, current * factor)` capped at `max` when the run
    /// timed out or came close to its timeout. Never shrinks.
    pub fn record(
        &mut self,
        elapsed: Duration,
        timeout_used: Duration,
        timed_out: bool,
        default: Duration,
        max: Duration,
        factor: f64,
    ) -> Duration {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(elapsed);

        let near_deadline = elapsed.as_secs_f64() >= timeout_used.as_secs_f64() * NEAR_DEADLINE_RATIO;
        if timed_out || near_deadline {
            let scaled = Duration::try_from_secs_f64(self.current.as_secs_f64() * factor.max(1.0))
                .unwrap_or(max);
            let next = scaled.max(default).min(max);
            self.current = self.current.max(next);
        }
        self.current
    }
}
