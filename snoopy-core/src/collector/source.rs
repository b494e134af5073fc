//! Raw source adapter contract
//!
//! Adapters wrap one native data source (a history file, a process table, a
//! filesystem watch). They know nothing about the buffer, the store, or
//! scheduling: a polled adapter answers [`PollRequest`]s, an event-driven one
//! pushes [`RawRecord`]s into a [`PushSink`].
//!
//! ## Error Handling
//!
//! - Records the adapter cannot shape go into [`Poll::malformed`], not `Err`
//! - `Err(Error::SourceUnavailable)` when the source is absent right now
//! - `Err(Error::PermissionDenied)` when a grant is missing
//! - `Err(Error::CorruptWatermark)` when the cursor no longer fits the source
//!   (file truncated, database replaced)

use crate::error::Result;
use crate::filter::ExclusionFilter;
use crate::stats::PipelineStats;
use crate::types::{Event, Value};
use crate::watermark::{Watermark, WatermarkKind};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One observation as the adapter saw it, already aimed at a domain table.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// Target domain table
    pub table: String,
    /// Observation time (epoch seconds)
    pub observed_at: f64,
    /// Domain column values, in order
    pub fields: Vec<(String, Value)>,
    /// Position of this record in its source, for watermark protocols
    pub position: Option<Watermark>,
    /// Names and paths consulted by exclusion filters
    pub subjects: Vec<String>,
    /// Logical key for state-change dedup and coalescing
    pub dedup_key: Option<String>,
}

impl RawRecord {
    pub fn new(table: impl Into<String>, observed_at: f64) -> Self {
        Self {
            table: table.into(),
            observed_at,
            fields: Vec::new(),
            position: None,
            subjects: Vec::new(),
            dedup_key: None,
        }
    }

    pub fn field(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((column.into(), value.into()));
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subjects.push(subject.into());
        self
    }

    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn position(mut self, position: Watermark) -> Self {
        self.position = Some(position);
        self
    }

    /// Normalize into an [`Event`].
    pub fn to_event(&self) -> Event {
        let mut event = Event::new(self.table.clone(), self.observed_at);
        for (column, value) in &self.fields {
            event.push(column.clone(), value.clone());
        }
        event.source_position = self.position.clone();
        event
    }
}

/// What a polled collector asks its adapter for.
#[derive(Debug, Clone, PartialEq)]
pub enum PollRequest {
    /// First run: records observed at or after `since`, plus the source-wide
    /// high-water mark in [`Poll::high_water`].
    Seed { since: f64 },
    /// Records positioned strictly after the watermark.
    Since(Watermark),
    /// Current state, for sources without a cursor.
    Snapshot,
}

/// Adapter answer to one [`PollRequest`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Poll {
    /// Well-formed records, any order
    pub records: Vec<RawRecord>,
    /// Descriptions of records that could not be shaped
    pub malformed: Vec<String>,
    /// Highest position in the source (seed) or observed this poll (incremental)
    pub high_water: Option<Watermark>,
}

impl Poll {
    pub fn records(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    pub fn with_high_water(mut self, high_water: Watermark) -> Self {
        self.high_water = Some(high_water);
        self
    }
}

/// A source sampled on a fixed cadence.
///
/// Calls run on the blocking thread pool, so implementations may do
/// synchronous I/O freely.
pub trait PollSource: Send {
    /// Acquire resources. Must be idempotent.
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Cursor shape this source supports; `None` for snapshot-only sources.
    fn watermark_kind(&self) -> Option<WatermarkKind>;

    /// Answer one request.
    fn poll(&mut self, request: &PollRequest) -> Result<Poll>;

    /// Release resources. Best-effort, must not block.
    fn teardown(&mut self) {}
}

/// A source that calls back as things happen.
pub trait PushSource: Send {
    /// Acquire resources. Must be idempotent.
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Start delivering records into `sink`.
    fn subscribe(&mut self, sink: PushSink) -> Result<()>;

    /// Stop delivering. Records already in the sink are still processed.
    fn unsubscribe(&mut self);
}

/// Non-blocking handle native callbacks push into.
///
/// Records matching the collector's exclusions are counted and discarded
/// here, before they take a channel slot. The channel behind it is bounded;
/// when it is full the record is dropped and counted rather than stalling the
/// callback thread.
#[derive(Clone)]
pub struct PushSink {
    collector: Arc<str>,
    tx: mpsc::Sender<RawRecord>,
    filter: Arc<ExclusionFilter>,
    stats: Arc<PipelineStats>,
}

impl PushSink {
    pub fn new(collector: &str, tx: mpsc::Sender<RawRecord>, stats: Arc<PipelineStats>) -> Self {
        Self {
            collector: Arc::from(collector),
            tx,
            filter: Arc::new(ExclusionFilter::default()),
            stats,
        }
    }

    pub fn with_filter(mut self, filter: Arc<ExclusionFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Hand a record to the collector.
    ///
    /// Returns false if the record was neither accepted nor excluded.
    pub fn push(&self, record: RawRecord) -> bool {
        if self.filter.is_excluded(&record.subjects) {
            self.stats.add_excluded(1);
            tracing::trace!(collector = %self.collector, subjects = ?record.subjects, "Excluded record");
            return true;
        }

        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.add_push_dropped(1);
                tracing::debug!(collector = %self.collector, "Push channel full, record dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// The collector has stopped listening.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
