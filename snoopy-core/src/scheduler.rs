//! Collector scheduling
//!
//! The [`Scheduler`] owns every collector for one daemon run:
//!
//! - each polled collector gets its own task and timer
//! - each event-driven collector gets a listening task
//! - one flush task drains the buffer on a timer or when the size threshold
//!   is reached, and writes heartbeats
//!
//! A failing collector only affects its own task. Shutdown cancels the
//! collector tasks, waits for in-flight work to land in the buffer, then
//! performs one final flush.

use crate::buffer::{BatchWriter, EventBuffer, FlushReport, Flusher, RetryPolicy};
use crate::collector::{Coalescer, Collector, EventDrivenCollector, PolledCollector, TickOutput};
use crate::config::{Config, SchedulerConfig};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::types::{now_epoch, Event};
use crate::watermark::{advance, Watermark, WatermarkKind};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Delay before the next tick after `failures` consecutive failures.
///
/// `interval * 2^failures`, capped at `ceiling` (but never below `interval`).
pub fn backoff_delay(interval: Duration, failures: u32, ceiling: Duration) -> Duration {
    if failures == 0 {
        return interval;
    }
    let factor = 2u32.saturating_pow(failures.min(31));
    interval.saturating_mul(factor).min(ceiling.max(interval))
}

/// Run a store call on the blocking pool.
async fn with_db<T, F>(db: &Arc<Database>, f: F) -> Result<T>
where
    F: FnOnce(&Database) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

fn lock(collector: &Mutex<PolledCollector>) -> MutexGuard<'_, PolledCollector> {
    collector
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared handles every collector task gets.
#[derive(Clone)]
struct TaskContext {
    db: Arc<Database>,
    buffer: Arc<EventBuffer>,
    flusher: Arc<Flusher>,
    stats: Arc<PipelineStats>,
    scheduler: SchedulerConfig,
    collect_timeout: Duration,
    cancel: CancellationToken,
}

/// Owns the collector registry until [`Scheduler::start`].
pub struct Scheduler {
    config: Config,
    db: Arc<Database>,
    collectors: Vec<Collector>,
    writer: Arc<dyn BatchWriter>,
    stats: Arc<PipelineStats>,
}

impl Scheduler {
    pub fn new(config: Config, db: Arc<Database>, collectors: Vec<Collector>) -> Self {
        let writer: Arc<dyn BatchWriter> = db.clone();
        Self {
            config,
            db,
            collectors,
            writer,
            stats: Arc::new(PipelineStats::new()),
        }
    }

    /// Commit batches somewhere other than the database. State reads and
    /// health rows still go to the database.
    pub fn with_writer(mut self, writer: Arc<dyn BatchWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn all collector tasks and the flush task.
    ///
    /// Must be called from within a tokio runtime. `cancel` stops the
    /// collectors; call [`SchedulerHandle::shutdown`] afterwards to join
    /// them and run the final flush.
    pub fn start(self, cancel: CancellationToken) -> Result<SchedulerHandle> {
        let mut seen = HashSet::new();
        for collector in &self.collectors {
            if !seen.insert(collector.name().to_string()) {
                return Err(Error::Config(format!(
                    "duplicate collector name '{}'",
                    collector.name()
                )));
            }
        }

        let daemon = &self.config.daemon;
        let run_id = uuid::Uuid::new_v4().to_string();
        let names: Vec<String> = self
            .collectors
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let buffer = Arc::new(EventBuffer::from_config(daemon, Arc::clone(&self.stats)));
        let flusher = Arc::new(Flusher::new(
            Arc::clone(&buffer),
            Arc::clone(&self.writer),
            RetryPolicy::from_config(daemon),
            Arc::clone(&self.stats),
        ));

        self.db.log_health(
            "startup",
            &serde_json::json!({
                "run_id": run_id,
                "pid": std::process::id(),
                "collectors": names,
            })
            .to_string(),
        )?;

        tracing::info!(
            run_id = %run_id,
            collectors = ?names,
            buffer_capacity = buffer.capacity(),
            "Scheduler starting"
        );

        let ctx = TaskContext {
            db: Arc::clone(&self.db),
            buffer: Arc::clone(&buffer),
            flusher: Arc::clone(&flusher),
            stats: Arc::clone(&self.stats),
            scheduler: self.config.scheduler.clone(),
            collect_timeout: daemon.collect_timeout(),
            cancel: cancel.clone(),
        };

        let mut tasks = Vec::with_capacity(self.collectors.len());
        for collector in self.collectors {
            let name = collector.name().to_string();
            let task = match collector {
                Collector::Polled(c) => tokio::spawn(PolledTask::new(c, ctx.clone()).run()),
                Collector::EventDriven(c) => tokio::spawn(run_event_driven(c, ctx.clone())),
            };
            tasks.push((name, task));
        }

        let flush_stop = CancellationToken::new();
        let flush_task = tokio::spawn(flush_loop(FlushLoop {
            flusher: Arc::clone(&flusher),
            buffer,
            db: Arc::clone(&self.db),
            stats: Arc::clone(&self.stats),
            run_id: run_id.clone(),
            flush_interval: daemon.flush_interval(),
            heartbeat_interval: daemon.heartbeat_interval(),
            stop: flush_stop.clone(),
            cancel: cancel.clone(),
        }));

        Ok(SchedulerHandle {
            run_id,
            cancel,
            flush_stop,
            tasks,
            flush_task,
            flusher,
            db: self.db,
            stats: self.stats,
        })
    }
}

/// Summary returned by [`SchedulerHandle::shutdown`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub stats: StatsSnapshot,
    pub final_flush: FlushReport,
    /// Set when the run ended because the event store became unreachable
    pub fatal: Option<String>,
}

/// A running scheduler.
pub struct SchedulerHandle {
    run_id: String,
    cancel: CancellationToken,
    flush_stop: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
    flush_task: JoinHandle<()>,
    flusher: Arc<Flusher>,
    db: Arc<Database>,
    stats: Arc<PipelineStats>,
}

impl SchedulerHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Flush outside the regular cadence.
    pub async fn flush_now(&self) -> FlushReport {
        self.flusher.flush().await
    }

    /// Stop every collector, flush what they produced, and record the shutdown.
    pub async fn shutdown(self) -> Result<RunReport> {
        self.cancel.cancel();

        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(collector = %name, error = %e, "Collector task panicked");
            }
        }

        // Producers are done; only now may the flush task stop.
        self.flush_stop.cancel();
        if let Err(e) = self.flush_task.await {
            tracing::error!(error = %e, "Flush task panicked");
        }

        let final_flush = self.flusher.flush().await;
        let stats = self.stats.snapshot();
        let fatal = self.flusher.fatal_error();

        let details = serde_json::json!({
            "run_id": self.run_id,
            "stats": stats,
            "fatal": fatal,
        })
        .to_string();
        if let Err(e) = with_db(&self.db, move |db| db.log_health("shutdown", &details)).await {
            if fatal.is_none() {
                return Err(e);
            }
            tracing::warn!(error = %e, "Could not record shutdown");
        }

        tracing::info!(
            run_id = %self.run_id,
            written = stats.events_written,
            lost = stats.events_lost,
            "Scheduler stopped"
        );

        Ok(RunReport {
            run_id: self.run_id,
            stats,
            final_flush,
            fatal,
        })
    }
}

// ============================================
// Polled collectors
// ============================================

enum Tick {
    Done,
    Failed,
    Suspend,
}

struct PolledTask {
    name: String,
    collector: Arc<Mutex<PolledCollector>>,
    interval: Duration,
    kind: Option<WatermarkKind>,
    /// In-memory cursor; the durable one advances only at flush
    watermark: Option<Watermark>,
    failures: u32,
    unavailable_logged: bool,
    /// A timed-out adapter call whose result is picked up next tick
    in_flight: Option<JoinHandle<Result<TickOutput>>>,
    ctx: TaskContext,
}

impl PolledTask {
    fn new(collector: PolledCollector, ctx: TaskContext) -> Self {
        Self {
            name: collector.name().to_string(),
            interval: collector.interval(),
            kind: collector.watermark_kind(),
            collector: Arc::new(Mutex::new(collector)),
            watermark: None,
            failures: 0,
            unavailable_logged: false,
            in_flight: None,
            ctx,
        }
    }

    async fn run(mut self) {
        let collector = Arc::clone(&self.collector);
        let setup = tokio::task::spawn_blocking(move || {
            let mut collector = lock(&collector);
            collector.setup()
        });
        match setup.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(collector = %self.name, error = %e, "Setup failed, collector disabled for this run");
                return;
            }
            Err(e) => {
                tracing::error!(collector = %self.name, error = %e, "Setup panicked, collector disabled for this run");
                return;
            }
        }

        if let Some(kind) = self.kind {
            let name = self.name.clone();
            match with_db(&self.ctx.db, move |db| db.load_watermark(&name, kind)).await {
                Ok(watermark) => self.watermark = watermark,
                Err(e) => {
                    tracing::warn!(collector = %self.name, error = %e, "Could not load watermark, seeding");
                }
            }
        }

        tracing::info!(
            collector = %self.name,
            interval_secs = self.interval.as_secs_f64(),
            watermark = ?self.watermark,
            "Collector started"
        );

        loop {
            if self.ctx.cancel.is_cancelled() {
                break;
            }
            if let Tick::Suspend = self.tick().await {
                break;
            }

            let delay = backoff_delay(
                self.interval,
                self.failures,
                Duration::from_secs(self.ctx.scheduler.max_backoff_secs),
            );
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.teardown();
    }

    async fn tick(&mut self) -> Tick {
        let mut call = match self.in_flight.take() {
            Some(late) => {
                tracing::debug!(collector = %self.name, "Waiting on previous timed-out call");
                late
            }
            None => {
                let collector = Arc::clone(&self.collector);
                let watermark = self.watermark.clone();
                tokio::task::spawn_blocking(move || {
                    let mut collector = lock(&collector);
                    collector.collect(watermark.as_ref(), now_epoch())
                })
            }
        };

        let joined = match tokio::time::timeout(self.ctx.collect_timeout, &mut call).await {
            Ok(joined) => joined,
            Err(_) => {
                self.in_flight = Some(call);
                let timeout = Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("adapter call exceeded {:?}", self.ctx.collect_timeout),
                ));
                return self.fail(timeout, true).await;
            }
        };

        match joined {
            Ok(Ok(output)) => {
                self.succeed(output).await;
                Tick::Done
            }
            Ok(Err(e)) => self.handle_error(e).await,
            Err(e) => {
                let panic = Error::Io(std::io::Error::other(format!("collector panicked: {}", e)));
                self.fail(panic, true).await
            }
        }
    }

    async fn succeed(&mut self, output: TickOutput) {
        let stats = &self.ctx.stats;
        stats.add_excluded(output.excluded as u64);
        stats.add_deduplicated(output.deduplicated as u64);
        stats.add_malformed(output.malformed as u64);

        if self.failures > 0 {
            tracing::info!(collector = %self.name, after_failures = self.failures, "Collector recovered");
            self.failures = 0;
            self.persist_failures().await;
        }
        self.unavailable_logged = false;

        let count = output.events.len();
        self.ctx
            .buffer
            .push(&self.name, output.events, output.watermark.clone())
            .await;
        if let Some(candidate) = output.watermark {
            self.watermark = Some(advance(self.watermark.as_ref(), candidate));
        }

        tracing::debug!(collector = %self.name, events = count, "Tick complete");
    }

    async fn handle_error(&mut self, error: Error) -> Tick {
        match error {
            Error::SourceUnavailable { .. } => self.fail(error, false).await,
            Error::PermissionDenied { .. } => {
                self.ctx.stats.add_collect_failures(1);
                self.failures = self.failures.saturating_add(1);
                self.persist_failures().await;
                tracing::error!(
                    collector = %self.name,
                    error = %error,
                    "Permission denied, collector suspended until restart"
                );
                Tick::Suspend
            }
            Error::CorruptWatermark { .. } => {
                tracing::warn!(collector = %self.name, error = %error, "Resetting watermark, next tick re-seeds");
                self.watermark = None;
                lock(&self.collector).reset();

                if let Err(e) = self.ctx.flusher.reset_progress(&self.name).await {
                    tracing::error!(collector = %self.name, error = %e, "Failed to reset stored watermark");
                }
                Tick::Done
            }
            other => self.fail(other, true).await,
        }
    }

    /// Count a failed tick. Only `suspendable` failures can suspend the collector.
    async fn fail(&mut self, error: Error, suspendable: bool) -> Tick {
        self.ctx.stats.add_collect_failures(1);
        self.failures = self.failures.saturating_add(1);
        self.persist_failures().await;

        if !suspendable {
            if self.unavailable_logged {
                tracing::debug!(collector = %self.name, failures = self.failures, error = %error, "Still unavailable");
            } else {
                tracing::warn!(collector = %self.name, error = %error, "Source unavailable, will keep retrying");
                self.unavailable_logged = true;
            }
            return Tick::Failed;
        }

        if self.failures >= self.ctx.scheduler.suspend_after_failures {
            tracing::error!(
                collector = %self.name,
                failures = self.failures,
                error = %error,
                "Collector keeps failing, suspended for the rest of this run"
            );
            return Tick::Suspend;
        }

        tracing::warn!(collector = %self.name, failures = self.failures, error = %error, "Collection failed");
        Tick::Failed
    }

    async fn persist_failures(&self) {
        let name = self.name.clone();
        let failures = self.failures;
        if let Err(e) = with_db(&self.ctx.db, move |db| db.record_failures(&name, failures)).await {
            tracing::debug!(collector = %self.name, error = %e, "Could not persist failure count");
        }
    }

    fn teardown(&mut self) {
        if self.in_flight.as_ref().is_some_and(|call| !call.is_finished()) {
            tracing::warn!(collector = %self.name, "Adapter call still running, skipping teardown");
            return;
        }

        match self.collector.try_lock() {
            Ok(mut collector) => collector.teardown(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().teardown(),
            Err(TryLockError::WouldBlock) => {
                tracing::warn!(collector = %self.name, "Collector busy, skipping teardown");
            }
        }
        tracing::info!(collector = %self.name, "Collector stopped");
    }
}

// ============================================
// Event-driven collectors
// ============================================

/// Normalize one window's survivors into events, updating counters.
fn close_window(
    collector: &EventDrivenCollector,
    window: &mut Coalescer,
    stats: &PipelineStats,
) -> Vec<Event> {
    let (records, collapsed) = window.take();
    stats.add_deduplicated(collapsed as u64);
    collector.process(records)
}

async fn run_event_driven(collector: EventDrivenCollector, ctx: TaskContext) {
    let name = collector.name().to_string();

    // Setup and subscribe may walk large directory trees.
    let (tx, mut rx) = mpsc::channel(collector.channel_capacity());
    let sink = collector.sink(tx, Arc::clone(&ctx.stats));
    let started = tokio::task::spawn_blocking(move || {
        let mut collector = collector;
        let result = collector.setup().and_then(|()| collector.subscribe(sink));
        (collector, result)
    })
    .await;
    let mut collector = match started {
        Ok((collector, Ok(()))) => collector,
        Ok((_, Err(e))) => {
            tracing::warn!(collector = %name, error = %e, "Setup failed, collector disabled for this run");
            return;
        }
        Err(e) => {
            tracing::error!(collector = %name, error = %e, "Setup panicked, collector disabled for this run");
            return;
        }
    };

    let coalesce = collector.coalesce();
    tracing::info!(collector = %name, coalesce_ms = coalesce.as_millis() as u64, "Collector listening");

    let mut window = Coalescer::new();
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            first = rx.recv() => match first {
                Some(record) => window.add(record),
                None => {
                    tracing::warn!(collector = %name, "Source stopped delivering");
                    break;
                }
            },
        }

        let deadline = tokio::time::sleep(coalesce);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = ctx.cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(record) => window.add(record),
                    None => break,
                },
            }
        }

        let events = close_window(&collector, &mut window, &ctx.stats);
        if !events.is_empty() {
            ctx.buffer.push(&name, events, None).await;
        }
    }

    collector.unsubscribe();
    while let Ok(record) = rx.try_recv() {
        window.add(record);
    }
    let events = close_window(&collector, &mut window, &ctx.stats);
    if !events.is_empty() {
        ctx.buffer.push(&name, events, None).await;
    }

    tracing::info!(collector = %name, "Collector stopped");
}

// ============================================
// Flush and heartbeat
// ============================================

struct FlushLoop {
    flusher: Arc<Flusher>,
    buffer: Arc<EventBuffer>,
    db: Arc<Database>,
    stats: Arc<PipelineStats>,
    run_id: String,
    flush_interval: Duration,
    heartbeat_interval: Duration,
    stop: CancellationToken,
    /// Cancelled when the store becomes unreachable
    cancel: CancellationToken,
}

async fn flush_loop(state: FlushLoop) {
    let started = Instant::now();

    let mut flush_tick = tokio::time::interval(state.flush_interval);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    flush_tick.tick().await;

    let mut heartbeat = tokio::time::interval(state.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = state.stop.cancelled() => break,
            _ = flush_tick.tick() => {
                if state.flusher.flush().await.fatal {
                    break;
                }
            }
            _ = state.buffer.flush_requested() => {
                if state.flusher.flush().await.fatal {
                    break;
                }
                flush_tick.reset();
            }
            _ = heartbeat.tick() => {
                let details = serde_json::json!({
                    "run_id": state.run_id,
                    "uptime_secs": started.elapsed().as_secs(),
                    "pending": state.buffer.len(),
                    "stats": state.stats.snapshot(),
                })
                .to_string();
                if let Err(e) = with_db(&state.db, move |db| db.log_health("heartbeat", &details)).await {
                    tracing::warn!(error = %e, "Failed to write heartbeat");
                }
            }
        }
    }

    if let Some(error) = state.flusher.fatal_error() {
        tracing::error!(error = %error, "Event store unreachable, stopping the run");
        state.cancel.cancel();
    }
}
