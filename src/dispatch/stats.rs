//! Dispatch counters for status reporting.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::dispatch::state::DeliveryState;

/// Per-source counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub delivered: u64,
    pub duplicates: u64,
    pub filtered: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub deferred: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

/// Shared counters, updated by workers and read by status queries.
#[derive(Debug, Default)]
pub struct DispatchStats {
    sources: Mutex<BTreeMap<i64, SourceStats>>,
    queue_depth: AtomicUsize,
    stale_checkpoints: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a terminal outcome.
    pub fn record_outcome(&self, source_id: i64, state: DeliveryState, reason: Option<&str>) {
        self.with_source(source_id, |s| match state {
            DeliveryState::Committed => s.delivered += 1,
            DeliveryState::Duplicate => s.duplicates += 1,
            DeliveryState::Filtered => s.filtered += 1,
            DeliveryState::Skipped => s.skipped += 1,
            DeliveryState::Dropped => {
                s.dropped += 1;
                s.failures += 1;
                s.last_error = reason.map(String::from);
            }
            _ => {}
        });
    }

    pub fn record_deferral(&self, source_id: i64) {
        self.with_source(source_id, |s| s.deferred += 1);
    }

    /// Record an error that did not end the message.
    pub fn record_error(&self, source_id: i64, error: &str) {
        self.with_source(source_id, |s| {
            s.failures += 1;
            s.last_error = Some(error.to_string());
        });
    }

    pub fn record_stale_checkpoint(&self, source_id: i64, error: &str) {
        self.stale_checkpoints.fetch_add(1, Ordering::Relaxed);
        self.record_error(source_id, error);
    }

    pub fn enqueued(&self) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dequeued(&self) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(1)));
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn stale_checkpoints(&self) -> u64 {
        self.stale_checkpoints.load(Ordering::Relaxed)
    }

    pub fn source(&self, source_id: i64) -> SourceStats {
        self.lock().get(&source_id).cloned().unwrap_or_default()
    }

    fn with_source(&self, source_id: i64, f: impl FnOnce(&mut SourceStats)) {
        f(self.lock().entry(source_id).or_default());
    }

    /// Counters stay readable after a worker panicked mid-update.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<i64, SourceStats>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
