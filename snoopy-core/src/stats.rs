//! Pipeline counters
//!
//! Failures that are handled locally (schema violations, dropped batches,
//! excluded records) still need to be observable. Every such path bumps a
//! counter here; `snapshot()` gives a consistent-enough view for logging
//! and tests.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared, lock-free counters for the capture pipeline
#[derive(Debug, Default)]
pub struct PipelineStats {
    events_buffered: AtomicU64,
    events_written: AtomicU64,
    duplicates_ignored: AtomicU64,
    schema_violations: AtomicU64,
    malformed_records: AtomicU64,
    records_excluded: AtomicU64,
    records_deduplicated: AtomicU64,
    overflow_dropped: AtomicU64,
    push_dropped: AtomicU64,
    batches_dropped: AtomicU64,
    events_lost: AtomicU64,
    collect_failures: AtomicU64,
    flushes: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Events accepted into the buffer
    pub events_buffered: u64,
    /// Rows inserted into event tables
    pub events_written: u64,
    /// Rows skipped because their natural key already existed
    pub duplicates_ignored: u64,
    /// Events rejected for an unknown table or column
    pub schema_violations: u64,
    /// Raw records an adapter could not shape into a record
    pub malformed_records: u64,
    /// Raw records dropped by exclusion filters
    pub records_excluded: u64,
    /// Raw records collapsed by state-change dedup or coalescing
    pub records_deduplicated: u64,
    /// Events discarded by the drop-oldest overflow policy
    pub overflow_dropped: u64,
    /// Pushed records dropped because the collector's channel was full
    pub push_dropped: u64,
    /// Batches dropped after exhausting write retries
    pub batches_dropped: u64,
    /// Events inside dropped batches
    pub events_lost: u64,
    /// Failed collector ticks
    pub collect_failures: u64,
    /// Completed flushes (including empty ones that wrote progress only)
    pub flushes: u64,
}

macro_rules! counter {
    ($add:ident, $field:ident) => {
        pub fn $add(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(add_buffered, events_buffered);
    counter!(add_written, events_written);
    counter!(add_duplicates, duplicates_ignored);
    counter!(add_schema_violations, schema_violations);
    counter!(add_malformed, malformed_records);
    counter!(add_excluded, records_excluded);
    counter!(add_deduplicated, records_deduplicated);
    counter!(add_overflow_dropped, overflow_dropped);
    counter!(add_push_dropped, push_dropped);
    counter!(add_batches_dropped, batches_dropped);
    counter!(add_events_lost, events_lost);
    counter!(add_collect_failures, collect_failures);
    counter!(add_flushes, flushes);

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_buffered: self.events_buffered.load(Ordering::Relaxed),
            events_written: self.events_written.load(Ordering::Relaxed),
            duplicates_ignored: self.duplicates_ignored.load(Ordering::Relaxed),
            schema_violations: self.schema_violations.load(Ordering::Relaxed),
            malformed_records: self.malformed_records.load(Ordering::Relaxed),
            records_excluded: self.records_excluded.load(Ordering::Relaxed),
            records_deduplicated: self.records_deduplicated.load(Ordering::Relaxed),
            overflow_dropped: self.overflow_dropped.load(Ordering::Relaxed),
            push_dropped: self.push_dropped.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            events_lost: self.events_lost.load(Ordering::Relaxed),
            collect_failures: self.collect_failures.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}
