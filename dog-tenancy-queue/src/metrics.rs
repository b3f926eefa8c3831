use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::HandlerFailure;
use crate::lifecycle::ConsumeOutcome;

/// Live counters for consumed messages
#[derive(Debug, Default)]
pub struct ConsumeMetrics {
    received: AtomicU64,
    completed: AtomicU64,
    handler_failed: AtomicU64,
    panicked: AtomicU64,
    rejected: AtomicU64,
    deferred: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeMetricsSnapshot {
    pub received: u64,
    pub completed: u64,
    pub handler_failed: u64,
    pub panicked: u64,
    pub rejected: u64,
    pub deferred: u64,
    pub cancelled: u64,
}

impl ConsumeMetricsSnapshot {
    /// Units that reached a terminal state.
    pub fn finished(&self) -> u64 {
        self.completed + self.handler_failed + self.rejected + self.deferred + self.cancelled
    }
}

impl ConsumeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &ConsumeOutcome) {
        let counter = match outcome {
            ConsumeOutcome::Completed { .. } => &self.completed,
            ConsumeOutcome::HandlerFailed { failure, .. } => {
                if matches!(failure, HandlerFailure::Panicked(_)) {
                    self.panicked.fetch_add(1, Ordering::Relaxed);
                }
                &self.handler_failed
            }
            ConsumeOutcome::Rejected(_) => &self.rejected,
            ConsumeOutcome::Deferred(_) => &self.deferred,
            ConsumeOutcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumeMetricsSnapshot {
        ConsumeMetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            handler_failed: self.handler_failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}
