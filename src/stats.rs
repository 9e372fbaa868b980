use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::AggregateRecord;

/// Process-wide counters surfaced by `/health`.
///
/// Components only ever increment; nothing here is read back to make
/// pipeline decisions.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub readings_accepted: AtomicU64,
    pub readings_malformed: AtomicU64,
    pub readings_late: AtomicU64,
    pub readings_dropped: AtomicU64,
    pub alerts_dropped: AtomicU64,
    pub open_windows: AtomicU64,
    pub aggregates_emitted: AtomicU64,
    pub sink_queue_depth: AtomicU64,
    pub writes_succeeded: AtomicU64,
    pub writes_retried: AtomicU64,
    pub writes_failed: AtomicU64,
    pub writes_abandoned: AtomicU64,
    pub alerts_raised: AtomicU64,
    pub alerts_suppressed: AtomicU64,
    pub alerts_undelivered: AtomicU64,
    dead_letters: Mutex<Vec<FailedWrite>>,
}

/// An aggregate that was never persisted, kept for offline recovery.
#[derive(Debug, Clone, Serialize)]
pub struct FailedWrite {
    pub path: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub record: AggregateRecord,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub readings_accepted: u64,
    pub readings_malformed: u64,
    pub readings_late: u64,
    pub readings_dropped: u64,
    pub alerts_dropped: u64,
    pub open_windows: u64,
    pub aggregates_emitted: u64,
    pub sink_queue_depth: u64,
    pub writes_succeeded: u64,
    pub writes_retried: u64,
    pub writes_failed: u64,
    pub writes_abandoned: u64,
    pub alerts_raised: u64,
    pub alerts_suppressed: u64,
    pub alerts_undelivered: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Saturating decrement; queue depth must never wrap.
    pub fn decr(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    pub fn set(counter: &AtomicU64, value: u64) {
        counter.store(value, Ordering::Relaxed);
    }

    pub fn record_failed_write(&self, failed: FailedWrite) {
        Self::incr(&self.writes_failed);
        self.dead_letter(failed);
    }

    /// Keep a record for recovery without counting it as a failed write.
    /// Writes cut off at the drain timeout land here; they are counted
    /// under `writes_abandoned`.
    pub fn dead_letter(&self, failed: FailedWrite) {
        if let Ok(mut guard) = self.dead_letters.lock() {
            guard.push(failed);
        }
    }

    pub fn failed_writes(&self) -> Vec<FailedWrite> {
        self.dead_letters
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            readings_accepted: load(&self.readings_accepted),
            readings_malformed: load(&self.readings_malformed),
            readings_late: load(&self.readings_late),
            readings_dropped: load(&self.readings_dropped),
            alerts_dropped: load(&self.alerts_dropped),
            open_windows: load(&self.open_windows),
            aggregates_emitted: load(&self.aggregates_emitted),
            sink_queue_depth: load(&self.sink_queue_depth),
            writes_succeeded: load(&self.writes_succeeded),
            writes_retried: load(&self.writes_retried),
            writes_failed: load(&self.writes_failed),
            writes_abandoned: load(&self.writes_abandoned),
            alerts_raised: load(&self.alerts_raised),
            alerts_suppressed: load(&self.alerts_suppressed),
            alerts_undelivered: load(&self.alerts_undelivered),
        }
    }
}
