//! End-to-end tests for the capture pipeline
//!
//! Each test drives real collectors through the scheduler into SQLite
//! (in-memory, or a temp file when a restart is involved) and inspects the
//! committed rows and watermarks.

use snoopy_core::collector::{
    Collector, EventDrivenCollector, Poll, PollRequest, PollSource, PolledCollector, PushSink,
    PushSource, RawRecord,
};
use snoopy_core::db::Database;
use snoopy_core::filter::ExclusionFilter;
use snoopy_core::scheduler::{RunReport, Scheduler};
use snoopy_core::watermark::{Watermark, WatermarkKind};
use snoopy_core::{now_epoch, Batch, Config, Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const DAY: f64 = 86_400.0;
const TICK: Duration = Duration::from_millis(20);

// ============================================
// Helpers
// ============================================

fn memory_db() -> Arc<Database> {
    let db = Database::open_in_memory().unwrap();
    db.migrate().unwrap();
    Arc::new(db)
}

fn file_db(dir: &TempDir) -> Arc<Database> {
    let db = Database::open(&dir.path().join("snoopy.db")).unwrap();
    db.migrate().unwrap();
    Arc::new(db)
}

async fn run_for(
    db: Arc<Database>,
    config: Config,
    collectors: Vec<Collector>,
    duration: Duration,
) -> RunReport {
    let handle = Scheduler::new(config, db, collectors)
        .start(CancellationToken::new())
        .unwrap();
    tokio::time::sleep(duration).await;
    handle.shutdown().await.unwrap()
}

type Rows = Arc<Mutex<Vec<(i64, f64, String)>>>;

/// A mailbox-like source with monotonic row ids.
struct Mailbox {
    rows: Rows,
    polls: Arc<AtomicU32>,
}

impl Mailbox {
    fn new(rows: &Rows) -> (Self, Arc<AtomicU32>) {
        let polls = Arc::new(AtomicU32::new(0));
        (
            Self {
                rows: rows.clone(),
                polls: polls.clone(),
            },
            polls,
        )
    }
}

impl PollSource for Mailbox {
    fn watermark_kind(&self) -> Option<WatermarkKind> {
        Some(WatermarkKind::RowId)
    }

    fn poll(&mut self, request: &PollRequest) -> Result<Poll> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let rows = self.rows.lock().unwrap();
        let max_id = rows.iter().map(|r| r.0).max();

        let selected: Vec<&(i64, f64, String)> = match request {
            PollRequest::Seed { since } => rows.iter().filter(|r| r.1 >= *since).collect(),
            PollRequest::Since(Watermark::RowId { id }) => {
                if max_id.is_some_and(|max| *id > max) {
                    return Err(Error::corrupt_watermark("mail", "mailbox was rebuilt"));
                }
                rows.iter().filter(|r| r.0 > *id).collect()
            }
            other => panic!("unexpected request {:?}", other),
        };

        let records = selected
            .into_iter()
            .map(|(id, ts, subject)| {
                RawRecord::new("mail_events", *ts)
                    .field("message_id", *id)
                    .field("subject", subject.as_str())
                    .position(Watermark::RowId { id: *id })
            })
            .collect();

        let mut poll = Poll::records(records);
        if matches!(request, PollRequest::Seed { .. }) {
            poll.high_water = max_id.map(|id| Watermark::RowId { id });
        }
        Ok(poll)
    }
}

fn mailbox(rows: &Rows) -> (Collector, Arc<AtomicU32>) {
    let (source, polls) = Mailbox::new(rows);
    let collector = PolledCollector::new("mail", Box::new(source), TICK).with_seed_days(1);
    (collector.into(), polls)
}

fn rows(entries: &[(i64, f64, &str)]) -> Rows {
    Arc::new(Mutex::new(
        entries
            .iter()
            .map(|(id, ts, s)| (*id, *ts, s.to_string()))
            .collect(),
    ))
}

/// Replays a script of frontmost-app snapshots, repeating the last one.
struct FrontApp {
    script: Vec<&'static str>,
    next: usize,
}

impl PollSource for FrontApp {
    fn watermark_kind(&self) -> Option<WatermarkKind> {
        None
    }

    fn poll(&mut self, _request: &PollRequest) -> Result<Poll> {
        let app = self.script[self.next.min(self.script.len() - 1)];
        self.next += 1;
        Ok(Poll::records(vec![RawRecord::new("window_events", now_epoch())
            .field("app_name", app)
            .subject(app)
            .dedup_key("frontmost")]))
    }
}

/// Fails every poll with the given error.
struct Broken {
    error: fn() -> Error,
    polls: Arc<AtomicU32>,
}

impl PollSource for Broken {
    fn watermark_kind(&self) -> Option<WatermarkKind> {
        None
    }

    fn poll(&mut self, _request: &PollRequest) -> Result<Poll> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }
}

fn broken(name: &str, error: fn() -> Error) -> (Collector, Arc<AtomicU32>) {
    let polls = Arc::new(AtomicU32::new(0));
    let source = Broken {
        error,
        polls: polls.clone(),
    };
    (
        PolledCollector::new(name, Box::new(source), TICK).into(),
        polls,
    )
}

fn app_names(db: &Database) -> Vec<String> {
    let conn = db.connection();
    let mut stmt = conn
        .prepare("SELECT app_name FROM window_events ORDER BY timestamp")
        .unwrap();
    let names = stmt
        .query_map([], |r| r.get(0))
        .unwrap()
        .collect::<rusqlite::Result<Vec<String>>>()
        .unwrap();
    names
}

// ============================================
// Watermarks
// ============================================

#[tokio::test]
async fn test_seed_then_incremental_across_restart() {
    let dir = TempDir::new().unwrap();
    let now = now_epoch();
    let mail = rows(&[
        (1, now - 5.0 * DAY, "old"),
        (2, now - 3.0 * DAY, "old"),
        (3, now - 0.5 * DAY, "recent"),
        (4, now - 0.2 * DAY, "recent"),
        (5, now - 0.1 * DAY, "recent"),
    ]);

    {
        let db = file_db(&dir);
        let (collector, _) = mailbox(&mail);
        run_for(db.clone(), Config::default(), vec![collector], TICK * 5).await;

        assert_eq!(db.count("mail_events").unwrap(), 3);
        assert_eq!(
            db.load_watermark("mail", WatermarkKind::RowId).unwrap(),
            Some(Watermark::RowId { id: 5 })
        );
    }

    mail.lock().unwrap().push((6, now, "new".to_string()));

    let db = file_db(&dir);
    let (collector, _) = mailbox(&mail);
    run_for(db.clone(), Config::default(), vec![collector], TICK * 5).await;

    assert_eq!(db.count("mail_events").unwrap(), 4);
    assert_eq!(
        db.load_watermark("mail", WatermarkKind::RowId).unwrap(),
        Some(Watermark::RowId { id: 6 })
    );
}

#[tokio::test]
async fn test_watermark_does_not_regress_across_runs() {
    let dir = TempDir::new().unwrap();
    let now = now_epoch();
    let mail = rows(&[(1, now, "a"), (2, now, "b"), (3, now, "c")]);

    let db = file_db(&dir);
    let (collector, _) = mailbox(&mail);
    run_for(db.clone(), Config::default(), vec![collector], TICK * 4).await;
    drop(db);

    // A later run that reports a lower position must not move the token back.
    let db = file_db(&dir);
    let mut batch = Batch::default();
    batch.progress.insert(
        "mail".to_string(),
        snoopy_core::buffer::Progress {
            watermark: Some(Watermark::RowId { id: 1 }),
            last_run_at: now,
        },
    );
    db.write_batch(&batch).unwrap();

    assert_eq!(
        db.load_watermark("mail", WatermarkKind::RowId).unwrap(),
        Some(Watermark::RowId { id: 3 })
    );
}

#[tokio::test]
async fn test_lost_watermark_commit_replays_without_duplicates() {
    let db = memory_db();
    let now = now_epoch();
    let mail = rows(&[(10, now - 60.0, "x"), (11, now - 30.0, "y")]);

    let (collector, _) = mailbox(&mail);
    run_for(db.clone(), Config::default(), vec![collector], TICK * 4).await;
    assert_eq!(db.count("mail_events").unwrap(), 2);

    // Simulate a crash between event commit and watermark commit.
    db.connection()
        .execute("DELETE FROM collector_state WHERE collector_name = 'mail'", [])
        .unwrap();

    let (collector, _) = mailbox(&mail);
    let report = run_for(db.clone(), Config::default(), vec![collector], TICK * 4).await;

    assert_eq!(db.count("mail_events").unwrap(), 2);
    assert!(report.stats.duplicates_ignored >= 2);
}

#[tokio::test]
async fn test_corrupt_cursor_reseeds() {
    let db = memory_db();
    let now = now_epoch();

    // A watermark from before the mailbox was rebuilt
    let mut batch = Batch::default();
    batch.progress.insert(
        "mail".to_string(),
        snoopy_core::buffer::Progress {
            watermark: Some(Watermark::RowId { id: 100 }),
            last_run_at: now - DAY,
        },
    );
    db.write_batch(&batch).unwrap();

    let mail = rows(&[(1, now - 10.0, "a"), (2, now - 5.0, "b")]);
    let (collector, _) = mailbox(&mail);
    run_for(db.clone(), Config::default(), vec![collector], TICK * 6).await;

    assert_eq!(db.count("mail_events").unwrap(), 2);
    assert_eq!(
        db.load_watermark("mail", WatermarkKind::RowId).unwrap(),
        Some(Watermark::RowId { id: 2 })
    );
}

/// A history file where the same command was logged twice in one second.
struct History {
    ts: f64,
}

impl PollSource for History {
    fn watermark_kind(&self) -> Option<WatermarkKind> {
        Some(WatermarkKind::ByteOffset)
    }

    fn poll(&mut self, request: &PollRequest) -> Result<Poll> {
        let after = match request {
            PollRequest::Since(Watermark::ByteOffset { offset }) => *offset,
            _ => 0,
        };
        let records = [25u64, 50]
            .into_iter()
            .filter(|end| *end > after)
            .map(|end| {
                RawRecord::new("shell_events", self.ts)
                    .field("command", "make test")
                    .position(Watermark::ByteOffset { offset: end })
            })
            .collect();
        Ok(Poll::records(records).with_high_water(Watermark::ByteOffset { offset: 50 }))
    }
}

#[tokio::test]
async fn test_identical_records_at_different_positions_are_both_kept() {
    let db = memory_db();
    let ts = now_epoch().floor() - 60.0;
    let history = || -> Collector { PolledCollector::new("shell", Box::new(History { ts }), TICK).into() };

    let report = run_for(db.clone(), Config::default(), vec![history()], TICK * 4).await;
    assert_eq!(db.count("shell_events").unwrap(), 2);
    assert_eq!(report.stats.duplicates_ignored, 0);

    // Re-reading the same file after a lost watermark adds nothing.
    db.connection()
        .execute("DELETE FROM collector_state WHERE collector_name = 'shell'", [])
        .unwrap();
    let report = run_for(db.clone(), Config::default(), vec![history()], TICK * 4).await;

    assert_eq!(db.count("shell_events").unwrap(), 2);
    assert_eq!(report.stats.duplicates_ignored, 2);
}

// ============================================
// Dedup and filtering
// ============================================

#[tokio::test]
async fn test_repeated_state_is_written_once() {
    let db = memory_db();
    let source = FrontApp {
        script: vec!["A", "A", "A", "B"],
        next: 0,
    };
    let collector = PolledCollector::new("window", Box::new(source), TICK);

    let report = run_for(db.clone(), Config::default(), vec![collector.into()], TICK * 12).await;

    assert_eq!(app_names(&db), vec!["A", "B"]);
    assert!(report.stats.records_deduplicated >= 2);
}

#[tokio::test]
async fn test_excluded_name_never_written() {
    let db = memory_db();
    let config: Config = toml::from_str(
        r#"
[filters]
exclude_names = ["SystemHelperX"]
"#,
    )
    .unwrap();

    let source = FrontApp {
        script: vec!["Safari", "SystemHelperX", "Terminal"],
        next: 0,
    };
    let collector = PolledCollector::new("window", Box::new(source), TICK)
        .configure(&config, &[], &[])
        .unwrap();

    let report = run_for(db.clone(), config, vec![collector.into()], TICK * 6).await;

    let names = app_names(&db);
    assert_eq!(names, vec!["Safari", "Terminal"]);
    assert!(report.stats.records_excluded >= 1);
}

// ============================================
// Schema allow-list
// ============================================

struct Mixed;

impl PollSource for Mixed {
    fn watermark_kind(&self) -> Option<WatermarkKind> {
        None
    }

    fn poll(&mut self, _request: &PollRequest) -> Result<Poll> {
        let ts = now_epoch();
        Ok(Poll::records(vec![
            RawRecord::new("bogus_events", ts).field("anything", 1i64),
            RawRecord::new("system_events", ts).field("event_type", "wake"),
        ]))
    }
}

#[tokio::test]
async fn test_unknown_table_rejected_and_counted() {
    let db = memory_db();
    let collector = PolledCollector::new("mixed", Box::new(Mixed), Duration::from_secs(60));

    let report = run_for(db.clone(), Config::default(), vec![collector.into()], TICK * 3).await;

    assert_eq!(report.stats.schema_violations, 1);
    assert_eq!(db.count("system_events").unwrap(), 1);
    let tables: i64 = db
        .connection()
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = 'bogus_events'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(tables, 0);
}

// ============================================
// Failure isolation
// ============================================

#[tokio::test]
async fn test_unavailable_collector_does_not_block_others() {
    let db = memory_db();
    let now = now_epoch();
    let mail = rows(&[(1, now - 10.0, "a"), (2, now - 5.0, "b")]);
    let (healthy, _) = mailbox(&mail);
    let (down, down_polls) = broken("messages", || {
        Error::unavailable("messages", "chat.db not found")
    });

    let mut config = Config::default();
    config.scheduler.suspend_after_failures = 2;

    let report = run_for(db.clone(), config, vec![down, healthy], TICK * 15).await;

    assert_eq!(db.count("mail_events").unwrap(), 2);
    assert_eq!(
        db.load_watermark("mail", WatermarkKind::RowId).unwrap(),
        Some(Watermark::RowId { id: 2 })
    );
    assert!(db.collector_state("messages").unwrap().is_none());
    assert!(report.stats.collect_failures >= 1);
    // Unavailable sources back off but are never suspended
    assert!(down_polls.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn test_chronic_failure_suspends_collector() {
    let db = memory_db();
    let (failing, polls) = broken("flaky", || {
        Error::SchemaDrift {
            collector: "flaky".to_string(),
            message: "unexpected column".to_string(),
        }
    });

    let mut config = Config::default();
    config.scheduler.suspend_after_failures = 3;

    run_for(db, config, vec![failing], Duration::from_millis(400)).await;

    assert_eq!(polls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_permission_denied_suspends_immediately() {
    let db = memory_db();
    let (denied, polls) = broken("mail", || {
        Error::permission_denied("mail", "full disk access required")
    });

    run_for(db, Config::default(), vec![denied], TICK * 6).await;

    assert_eq!(polls.load(Ordering::SeqCst), 1);
}

// ============================================
// Event-driven collectors
// ============================================

/// Delivers a fixed set of records as soon as it is subscribed.
struct Burst {
    records: Vec<RawRecord>,
    sink: Option<PushSink>,
}

impl PushSource for Burst {
    fn subscribe(&mut self, sink: PushSink) -> Result<()> {
        for record in self.records.drain(..) {
            sink.push(record);
        }
        self.sink = Some(sink);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.sink = None;
    }
}

fn file_change(path: &str, kind: &str) -> RawRecord {
    RawRecord::new("file_events", now_epoch())
        .field("event_type", kind)
        .field("file_path", path)
        .subject(path)
        .dedup_key(path)
}

#[tokio::test]
async fn test_pushed_records_are_coalesced_and_filtered() {
    let db = memory_db();
    let source = Burst {
        records: vec![
            file_change("/work/a.txt", "created"),
            file_change("/work/a.txt", "modified"),
            file_change("/work/b.txt", "modified"),
            file_change("/work/.git/index", "modified"),
        ],
        sink: None,
    };
    let filter = ExclusionFilter::new(Vec::<String>::new(), ["/.git/"]).unwrap();
    let collector = EventDrivenCollector::new("filesystem", Box::new(source))
        .with_coalesce(Duration::from_millis(50))
        .with_filter(filter);

    let report = run_for(db.clone(), Config::default(), vec![collector.into()], TICK * 8).await;

    let conn = db.connection();
    let mut stmt = conn
        .prepare("SELECT file_path, event_type FROM file_events ORDER BY id")
        .unwrap();
    let rows: Vec<(String, String)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();

    assert_eq!(
        rows,
        vec![
            ("/work/a.txt".to_string(), "modified".to_string()),
            ("/work/b.txt".to_string(), "modified".to_string()),
        ]
    );
    assert_eq!(report.stats.records_deduplicated, 1);
    assert_eq!(report.stats.records_excluded, 1);
}

#[tokio::test]
async fn test_shutdown_flushes_pending_window() {
    let db = memory_db();
    let source = Burst {
        records: vec![file_change("/work/late.txt", "created")],
        sink: None,
    };
    // Window far longer than the run: only shutdown can close it
    let collector = EventDrivenCollector::new("filesystem", Box::new(source))
        .with_coalesce(Duration::from_secs(30));

    run_for(db.clone(), Config::default(), vec![collector.into()], TICK * 3).await;

    assert_eq!(db.count("file_events").unwrap(), 1);
}
