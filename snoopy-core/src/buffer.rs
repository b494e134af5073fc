//! Event buffer and flush
//!
//! Collectors push events (and the watermark those events bring them to)
//! into one shared [`EventBuffer`]. The [`Flusher`] swaps the buffer out
//! under a short lock and hands the whole [`Batch`] to the store as a single
//! transaction, so a watermark is never committed without its events.

use crate::config::{DaemonConfig, OverflowPolicy};
use crate::db::WriteOutcome;
use crate::error::{Error, Result};
use crate::stats::PipelineStats;
use crate::types::{now_epoch, Event};
use crate::watermark::{advance, Watermark};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// An event tagged with the collector that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub collector: String,
    pub event: Event,
}

/// What a collector's buffered events amount to, committed with them.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Highest watermark reached by pushes in this batch
    pub watermark: Option<Watermark>,
    /// When the latest contributing tick ran (epoch seconds)
    pub last_run_at: f64,
}

/// Everything one flush commits.
#[derive(Debug, Default)]
pub struct Batch {
    /// Events in buffer order
    pub events: Vec<PendingEvent>,
    /// Progress per contributing collector
    pub progress: BTreeMap<String, Progress>,
}

impl Batch {
    /// Nothing to write: no events and no progress.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.progress.is_empty()
    }

    /// Names of every collector with events or progress in this batch.
    pub fn collectors(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.progress.keys().map(String::as_str).collect();
        for pending in &self.events {
            if !names.contains(&pending.collector.as_str()) {
                names.push(&pending.collector);
            }
        }
        names
    }
}

/// Sink for committed batches. Implemented by [`crate::Database`].
pub trait BatchWriter: Send + Sync {
    /// Write the batch all-or-nothing.
    fn write_batch(&self, batch: &Batch) -> Result<WriteOutcome>;

    /// Forget a collector's committed watermark.
    fn reset_progress(&self, collector: &str) -> Result<()>;
}

#[derive(Default)]
struct Inner {
    events: VecDeque<PendingEvent>,
    progress: BTreeMap<String, Progress>,
}

/// Bounded multi-producer staging area in front of the store.
pub struct EventBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    flush_threshold: usize,
    policy: OverflowPolicy,
    flush_wanted: Notify,
    space_freed: Notify,
    stats: Arc<PipelineStats>,
}

impl EventBuffer {
    pub fn new(
        capacity: usize,
        flush_threshold: usize,
        policy: OverflowPolicy,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            flush_threshold: flush_threshold.clamp(1, capacity.max(1)),
            policy,
            flush_wanted: Notify::new(),
            space_freed: Notify::new(),
            stats,
        }
    }

    pub fn from_config(config: &DaemonConfig, stats: Arc<PipelineStats>) -> Self {
        Self::new(
            config.buffer_capacity,
            config.flush_threshold,
            config.overflow,
            stats,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stage one tick's output.
    ///
    /// `events` keep their order. `watermark` is merged monotonically into
    /// the collector's pending progress, which the next flush commits in the
    /// same transaction as the events. Under [`OverflowPolicy::Block`] this
    /// waits for a flush when the events don't fit; a tick larger than the
    /// whole buffer is admitted once the buffer is empty.
    pub async fn push(&self, collector: &str, events: Vec<Event>, watermark: Option<Watermark>) {
        let count = events.len();

        loop {
            // Register before checking so a drain between check and await is not missed
            let space_freed = self.space_freed.notified();
            {
                let mut inner = self.lock();
                let free = self.capacity.saturating_sub(inner.events.len());

                let fits = count <= free || inner.events.is_empty();
                if fits || self.policy == OverflowPolicy::DropOldest {
                    if !fits {
                        let overflow = (inner.events.len() + count).saturating_sub(self.capacity);
                        let dropped = overflow.min(inner.events.len());
                        inner.events.drain(..dropped);
                        self.stats.add_overflow_dropped(dropped as u64);
                        tracing::warn!(
                            collector = %collector,
                            dropped,
                            capacity = self.capacity,
                            "Buffer full, dropped oldest pending events"
                        );
                    }

                    self.append(&mut inner, collector, events, watermark);
                    if inner.events.len() >= self.flush_threshold {
                        self.flush_wanted.notify_one();
                    }
                    return;
                }
            }

            tracing::debug!(collector = %collector, count, "Buffer full, waiting for flush");
            self.flush_wanted.notify_one();
            space_freed.await;
        }
    }

    fn append(
        &self,
        inner: &mut Inner,
        collector: &str,
        events: Vec<Event>,
        watermark: Option<Watermark>,
    ) {
        self.stats.add_buffered(events.len() as u64);
        inner
            .events
            .extend(events.into_iter().map(|event| PendingEvent {
                collector: collector.to_string(),
                event,
            }));

        let now = now_epoch();
        let progress = inner
            .progress
            .entry(collector.to_string())
            .or_insert(Progress {
                watermark: None,
                last_run_at: now,
            });
        progress.last_run_at = now;
        if let Some(candidate) = watermark {
            progress.watermark = Some(advance(progress.watermark.as_ref(), candidate));
        }
    }

    /// Swap out everything pending.
    pub fn drain(&self) -> Batch {
        let taken = std::mem::take(&mut *self.lock());
        self.space_freed.notify_waiters();
        Batch {
            events: taken.events.into(),
            progress: taken.progress,
        }
    }

    /// Forget a collector's pending watermark after its source was reset.
    ///
    /// Its already-buffered events stay; they are still valid observations.
    pub fn reset_progress(&self, collector: &str) {
        if let Some(progress) = self.lock().progress.get_mut(collector) {
            progress.watermark = None;
        }
    }

    /// Resolves once the size threshold has been reached (or a producer is blocked).
    pub async fn flush_requested(&self) {
        self.flush_wanted.notified().await;
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Bounded exponential backoff for store writes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            attempts: config.write_retry_attempts.max(1),
            base: Duration::from_millis(config.write_retry_base_ms),
            max: Duration::from_millis(config.write_retry_max_ms),
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// What one flush did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlushReport {
    /// Events taken from the buffer
    pub drained: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    /// Write attempts made (0 for an empty flush)
    pub attempts: u32,
    /// The batch was dropped after exhausting retries
    pub dropped: bool,
    /// The store itself is unreachable; retrying was pointless
    pub fatal: bool,
}

/// Drains the buffer into a [`BatchWriter`].
pub struct Flusher {
    buffer: Arc<EventBuffer>,
    writer: Arc<dyn BatchWriter>,
    retry: RetryPolicy,
    stats: Arc<PipelineStats>,
    // Serializes timer, threshold and final flushes, and progress resets
    running: tokio::sync::Mutex<()>,
    fatal: Mutex<Option<String>>,
}

impl Flusher {
    pub fn new(
        buffer: Arc<EventBuffer>,
        writer: Arc<dyn BatchWriter>,
        retry: RetryPolicy,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            buffer,
            writer,
            retry,
            stats,
            running: tokio::sync::Mutex::new(()),
            fatal: Mutex::new(None),
        }
    }

    /// The first store failure that cannot be retried away, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record_fatal(&self, error: &Error) {
        let mut fatal = self.fatal.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if fatal.is_none() {
            *fatal = Some(error.to_string());
        }
    }

    /// Forget `collector`'s progress, pending and committed.
    ///
    /// Holds the flush lock, so a batch drained before the reset cannot
    /// commit the old position after it.
    pub async fn reset_progress(&self, collector: &str) -> Result<()> {
        let _running = self.running.lock().await;
        self.buffer.reset_progress(collector);

        let writer = Arc::clone(&self.writer);
        let name = collector.to_string();
        tokio::task::spawn_blocking(move || writer.reset_progress(&name))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    /// Drain the buffer and commit it, retrying with backoff.
    ///
    /// The batch is held across retries. After the last attempt it is dropped:
    /// the contributing collectors' watermarks were not advanced, so their
    /// sources are re-read on the next run. A fatal store error ends the
    /// retries at once and is kept for [`Flusher::fatal_error`].
    pub async fn flush(&self) -> FlushReport {
        let _running = self.running.lock().await;

        let batch = self.buffer.drain();
        if batch.is_empty() {
            return FlushReport::default();
        }

        let batch = Arc::new(batch);
        let mut report = FlushReport {
            drained: batch.events.len(),
            ..FlushReport::default()
        };

        let mut last_error = String::new();
        for attempt in 1..=self.retry.attempts {
            report.attempts = attempt;

            let writer = Arc::clone(&self.writer);
            let pending = Arc::clone(&batch);
            let result = tokio::task::spawn_blocking(move || writer.write_batch(&pending)).await;

            match result {
                Ok(Ok(outcome)) => {
                    report.inserted = outcome.inserted;
                    report.duplicates = outcome.duplicates;
                    report.rejected = outcome.rejected.len();

                    self.stats.add_written(outcome.inserted as u64);
                    self.stats.add_duplicates(outcome.duplicates as u64);
                    self.stats.add_schema_violations(outcome.rejected.len() as u64);
                    self.stats.add_flushes(1);

                    tracing::debug!(
                        drained = report.drained,
                        inserted = outcome.inserted,
                        duplicates = outcome.duplicates,
                        rejected = report.rejected,
                        advanced = ?outcome.watermarks_advanced,
                        "Flushed batch"
                    );
                    return report;
                }
                Ok(Err(e)) if e.is_fatal() => {
                    tracing::error!(error = %e, "Event store is unreachable");
                    self.record_fatal(&e);
                    last_error = e.to_string();
                    report.fatal = true;
                    break;
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        attempt,
                        max_attempts = self.retry.attempts,
                        error = %e,
                        "Batch write failed"
                    );
                }
                Err(join_error) => {
                    // A panicking writer is not retried
                    last_error = join_error.to_string();
                    break;
                }
            }

            if attempt < self.retry.attempts {
                tokio::time::sleep(self.retry.delay(attempt)).await;
            }
        }

        let failure = Error::WriteFailure {
            attempts: report.attempts,
            message: last_error,
        };
        tracing::error!(
            events = report.drained,
            collectors = ?batch.collectors(),
            error = %failure,
            "Dropping batch, events lost and watermarks not advanced"
        );
        self.stats.add_batches_dropped(1);
        self.stats.add_events_lost(report.drained as u64);
        report.dropped = true;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn buffer(capacity: usize, threshold: usize, policy: OverflowPolicy) -> Arc<EventBuffer> {
        Arc::new(EventBuffer::new(
            capacity,
            threshold,
            policy,
            Arc::new(PipelineStats::new()),
        ))
    }

    fn events(n: usize) -> Vec<Event> {
        (0..n)
            .map(|i| Event::new("shell_events", i as f64).with("command", format!("cmd{}", i)))
            .collect()
    }

    /// Fails the first `failures` writes, then succeeds.
    struct FlakyWriter {
        failures: u32,
        calls: AtomicU32,
    }

    impl BatchWriter for FlakyWriter {
        fn write_batch(&self, batch: &Batch) -> Result<WriteOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(Error::Config("disk on fire".to_string()));
            }
            Ok(WriteOutcome {
                inserted: batch.events.len(),
                ..WriteOutcome::default()
            })
        }

        fn reset_progress(&self, _collector: &str) -> Result<()> {
            Ok(())
        }
    }

    /// The database file vanished or can no longer be opened.
    struct UnopenableStore {
        calls: AtomicU32,
    }

    impl BatchWriter for UnopenableStore {
        fn write_batch(&self, _batch: &Batch) -> Result<WriteOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                None,
            )))
        }

        fn reset_progress(&self, _collector: &str) -> Result<()> {
            Ok(())
        }
    }

    /// Records the order of writes and resets.
    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<String>>,
    }

    impl BatchWriter for Journal {
        fn write_batch(&self, batch: &Batch) -> Result<WriteOutcome> {
            std::thread::sleep(Duration::from_millis(50));
            let progress = batch
                .progress
                .iter()
                .map(|(name, p)| format!("write {} {:?}", name, p.watermark))
                .collect::<Vec<_>>();
            self.entries.lock().unwrap().extend(progress);
            Ok(WriteOutcome::default())
        }

        fn reset_progress(&self, collector: &str) -> Result<()> {
            self.entries
                .lock()
                .unwrap()
                .push(format!("reset {}", collector));
            Ok(())
        }
    }

    fn quick_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_push_and_drain_preserves_order() {
        let buf = buffer(10, 10, OverflowPolicy::Block);
        buf.push("shell", events(3), Some(Watermark::ByteOffset { offset: 30 }))
            .await;

        let batch = buf.drain();
        let commands: Vec<_> = batch
            .events
            .iter()
            .map(|p| p.event.get("command").cloned())
            .collect();
        assert_eq!(
            commands,
            vec![
                Some("cmd0".into()),
                Some("cmd1".into()),
                Some("cmd2".into())
            ]
        );
        assert_eq!(
            batch.progress["shell"].watermark,
            Some(Watermark::ByteOffset { offset: 30 })
        );
        assert!(buf.is_empty());
        assert!(buf.drain().is_empty());
    }

    #[tokio::test]
    async fn test_pending_watermark_is_monotonic() {
        let buf = buffer(10, 10, OverflowPolicy::Block);
        buf.push("mail", vec![], Some(Watermark::RowId { id: 7 })).await;
        buf.push("mail", vec![], Some(Watermark::RowId { id: 4 })).await;
        buf.push("mail", vec![], None).await;

        let batch = buf.drain();
        assert_eq!(batch.progress["mail"].watermark, Some(Watermark::RowId { id: 7 }));
    }

    #[tokio::test]
    async fn test_reset_progress_clears_pending_watermark() {
        let buf = buffer(10, 10, OverflowPolicy::Block);
        buf.push("shell", events(1), Some(Watermark::ByteOffset { offset: 900 }))
            .await;
        buf.reset_progress("shell");

        let batch = buf.drain();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.progress["shell"].watermark, None);
    }

    #[tokio::test]
    async fn test_drop_oldest_policy() {
        let buf = buffer(3, 3, OverflowPolicy::DropOldest);
        buf.push("shell", events(2), None).await;
        buf.push("shell", events(2), None).await;

        assert_eq!(buf.len(), 3);
        assert_eq!(buf.stats.snapshot().overflow_dropped, 1);
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_drain() {
        let buf = buffer(2, 2, OverflowPolicy::Block);
        buf.push("a", events(2), None).await;

        let producer = {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move { buf.push("b", events(1), None).await })
        };

        // Threshold reached, so a flush is requested
        tokio::time::timeout(Duration::from_secs(1), buf.flush_requested())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        let first = buf.drain();
        assert_eq!(first.events.len(), 2);

        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.stats.snapshot().overflow_dropped, 0);
    }

    #[tokio::test]
    async fn test_oversized_push_admitted_when_empty() {
        let buf = buffer(2, 2, OverflowPolicy::Block);
        buf.push("shell", events(5), None).await;
        assert_eq!(buf.len(), 5);
    }

    #[tokio::test]
    async fn test_flush_retries_then_succeeds() {
        let stats = Arc::new(PipelineStats::new());
        let buf = Arc::new(EventBuffer::new(10, 10, OverflowPolicy::Block, stats.clone()));
        let writer = Arc::new(FlakyWriter {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let flusher = Flusher::new(buf.clone(), writer, quick_retry(5), stats.clone());

        buf.push("shell", events(4), None).await;
        let report = flusher.flush().await;

        assert_eq!(report.attempts, 3);
        assert_eq!(report.inserted, 4);
        assert!(!report.dropped);
        assert_eq!(stats.snapshot().events_written, 4);
    }

    #[tokio::test]
    async fn test_flush_drops_batch_after_retries() {
        let stats = Arc::new(PipelineStats::new());
        let buf = Arc::new(EventBuffer::new(10, 10, OverflowPolicy::Block, stats.clone()));
        let writer = Arc::new(FlakyWriter {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let flusher = Flusher::new(buf.clone(), writer.clone(), quick_retry(3), stats.clone());

        buf.push("shell", events(4), None).await;
        let report = flusher.flush().await;

        assert!(report.dropped);
        assert_eq!(writer.calls.load(Ordering::SeqCst), 3);
        let snap = stats.snapshot();
        assert_eq!(snap.batches_dropped, 1);
        assert_eq!(snap.events_lost, 4);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_store_is_fatal_without_retries() {
        let stats = Arc::new(PipelineStats::new());
        let buf = Arc::new(EventBuffer::new(10, 10, OverflowPolicy::Block, stats.clone()));
        let writer = Arc::new(UnopenableStore {
            calls: AtomicU32::new(0),
        });
        let flusher = Flusher::new(buf.clone(), writer.clone(), quick_retry(5), stats.clone());
        assert_eq!(flusher.fatal_error(), None);

        buf.push("shell", events(2), None).await;
        let report = flusher.flush().await;

        assert!(report.fatal);
        assert!(report.dropped);
        assert_eq!(report.attempts, 1);
        assert_eq!(writer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().events_lost, 2);
        assert!(flusher.fatal_error().unwrap().contains("database error"));
    }

    #[tokio::test]
    async fn test_reset_waits_for_in_flight_flush() {
        let stats = Arc::new(PipelineStats::new());
        let buf = Arc::new(EventBuffer::new(10, 10, OverflowPolicy::Block, stats.clone()));
        let journal = Arc::new(Journal::default());
        let flusher = Arc::new(Flusher::new(
            buf.clone(),
            journal.clone(),
            quick_retry(1),
            stats,
        ));

        buf.push("shell", events(1), Some(Watermark::ByteOffset { offset: 900 }))
            .await;
        let in_flight = {
            let flusher = Arc::clone(&flusher);
            tokio::spawn(async move { flusher.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        flusher.reset_progress("shell").await.unwrap();
        in_flight.await.unwrap();

        let entries = journal.entries.lock().unwrap().clone();
        assert_eq!(
            entries,
            vec![
                "write shell Some(ByteOffset { offset: 900 })".to_string(),
                "reset shell".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_flush_skips_writer() {
        let buf = buffer(10, 10, OverflowPolicy::Block);
        let writer = Arc::new(FlakyWriter {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let flusher = Flusher::new(
            buf,
            writer.clone(),
            quick_retry(1),
            Arc::new(PipelineStats::new()),
        );

        assert_eq!(flusher.flush().await, FlushReport::default());
        assert_eq!(writer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = RetryPolicy {
            attempts: 10,
            base: Duration::from_millis(200),
            max: Duration::from_secs(1),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(40), Duration::from_secs(1));
    }
}
