use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct Metrics {
    contexts_registered: AtomicU64,
    contexts_rejected: AtomicU64,
    contexts_cleared: AtomicU64,
    contexts_expired: AtomicU64,
    executions_started: AtomicU64,
    executions_succeeded: AtomicU64,
    executions_failed: AtomicU64,
    executions_timed_out: AtomicU64,
    breaker_rejections: AtomicU64,
    cleanup_failures: AtomicU64,
    events_delivered: AtomicU64,
    events_deduplicated: AtomicU64,
    events_buffered: AtomicU64,
    broadcast_failures: AtomicU64,
    messages_routed: AtomicU64,
    routing_errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_contexts_registered(&self) {
        self.contexts_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_contexts_rejected(&self) {
        self.contexts_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_contexts_cleared(&self) {
        self.contexts_cleared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_contexts_expired(&self) {
        self.contexts_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_executions_started(&self) {
        self.executions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_executions_succeeded(&self) {
        self.executions_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_executions_failed(&self) {
        self.executions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_executions_timed_out(&self) {
        self.executions_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_breaker_rejections(&self) {
        self.breaker_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cleanup_failures(&self) {
        self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_deduplicated(&self) {
        self.events_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_buffered(&self) {
        self.events_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_broadcast_failures(&self) {
        self.broadcast_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages_routed(&self) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_routing_errors(&self) {
        self.routing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            contexts_registered: self.contexts_registered.load(Ordering::Relaxed),
            contexts_rejected: self.contexts_rejected.load(Ordering::Relaxed),
            contexts_cleared: self.contexts_cleared.load(Ordering::Relaxed),
            contexts_expired: self.contexts_expired.load(Ordering::Relaxed),
            executions_started: self.executions_started.load(Ordering::Relaxed),
            executions_succeeded: self.executions_succeeded.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            executions_timed_out: self.executions_timed_out.load(Ordering::Relaxed),
            breaker_rejections: self.breaker_rejections.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_deduplicated: self.events_deduplicated.load(Ordering::Relaxed),
            events_buffered: self.events_buffered.load(Ordering::Relaxed),
            broadcast_failures: self.broadcast_failures.load(Ordering::Relaxed),
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            routing_errors: self.routing_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub contexts_registered: u64,
    pub contexts_rejected: u64,
    pub contexts_cleared: u64,
    pub contexts_expired: u64,
    pub executions_started: u64,
    pub executions_succeeded: u64,
    pub executions_failed: u64,
    pub executions_timed_out: u64,
    pub breaker_rejections: u64,
    pub cleanup_failures: u64,
    pub events_delivered: u64,
    pub events_deduplicated: u64,
    pub events_buffered: u64,
    pub broadcast_failures: u64,
    pub messages_routed: u64,
    pub routing_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.inc_contexts_registered();
        metrics.inc_contexts_registered();
        metrics.inc_events_deduplicated();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.contexts_registered, 2);
        assert_eq!(snapshot.events_deduplicated, 1);
        assert_eq!(snapshot.executions_timed_out, 0);
    }
}
