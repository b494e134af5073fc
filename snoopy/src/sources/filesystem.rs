//! Filesystem change adapter
//!
//! Watches a handful of user directories recursively through `notify`,
//! debounced with `notify-debouncer-mini`. The debouncer reports that a path
//! changed, not how, so the change kind is inferred from the path's current
//! state: gone means `removed`, freshly created means `created`, anything
//! else `modified`.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use snoopy_core::collector::{PushSink, PushSource, RawRecord};
use snoopy_core::{now_epoch, Error, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const NAME: &str = "filesystem";

/// Debounce applied by the watcher itself
pub const DEBOUNCE: Duration = Duration::from_secs(1);

/// Build output, VCS internals, caches and temp files
pub const BUILTIN_EXCLUDED_PATHS: &[&str] = &[
    "/.git/objects/",
    "/.git/refs/remotes/",
    "/.git/FETCH_HEAD",
    "/.git/ORIG_HEAD",
    "/.git/modules/",
    "/__pycache__/",
    "/.DS_Store",
    "/target/",
    "/node_modules/",
    "/.venv/",
    "/venv/",
    "/site-packages/",
    ".crdownload",
    ".com.google.Chrome.",
    ".tmp",
    ".temp",
    ".swp",
    "/logs/",
];

pub struct FileWatcher {
    roots: Vec<PathBuf>,
    debounce: Duration,
    debouncer: Option<Debouncer<RecommendedWatcher>>,
}

impl FileWatcher {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            debounce: DEBOUNCE,
            debouncer: None,
        }
    }

    /// `~/Documents`, `~/Downloads` and `~/Desktop`.
    pub fn default_roots(home: &Path) -> Vec<PathBuf> {
        ["Documents", "Downloads", "Desktop"]
            .iter()
            .map(|dir| home.join(dir))
            .collect()
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn existing_roots(&self) -> Vec<&PathBuf> {
        self.roots.iter().filter(|root| root.is_dir()).collect()
    }
}

impl PushSource for FileWatcher {
    fn setup(&mut self) -> Result<()> {
        if self.existing_roots().is_empty() {
            return Err(Error::unavailable(
                NAME,
                format!("none of the watch directories exist: {:?}", self.roots),
            ));
        }
        Ok(())
    }

    fn subscribe(&mut self, sink: PushSink) -> Result<()> {
        if self.debouncer.is_some() {
            return Ok(());
        }

        let fresh_within = self.debounce + Duration::from_secs(1);
        let mut debouncer = new_debouncer(self.debounce, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        let record = change_record(&event.path, now_epoch(), fresh_within);
                        if !sink.push(record) && sink.is_closed() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::warn!(collector = NAME, error = ?e, "Watch error"),
            }
        })
        .map_err(|e| Error::unavailable(NAME, format!("failed to start watcher: {}", e)))?;

        let mut watched = 0;
        for root in self.existing_roots() {
            match debouncer.watcher().watch(root, RecursiveMode::Recursive) {
                Ok(()) => watched += 1,
                Err(e) => tracing::warn!(
                    collector = NAME,
                    path = %root.display(),
                    error = %e,
                    "Cannot watch directory"
                ),
            }
        }
        if watched == 0 {
            return Err(Error::unavailable(NAME, "no directory could be watched"));
        }

        tracing::info!(collector = NAME, directories = watched, "Watching for file changes");
        self.debouncer = Some(debouncer);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        // Dropping the debouncer stops its thread and the OS watch.
        self.debouncer = None;
    }
}

/// Shape one debounced change into a `file_events` record.
fn change_record(path: &Path, now: f64, fresh_within: Duration) -> RawRecord {
    let age = std::fs::symlink_metadata(path).ok().map(|meta| {
        meta.created()
            .ok()
            .and_then(|created| SystemTime::now().duration_since(created).ok())
    });
    let event_type = classify(age, fresh_within);

    let file_path = path.to_string_lossy().into_owned();
    let directory = path
        .parent()
        .map(|dir| dir.to_string_lossy().into_owned())
        .unwrap_or_default();

    RawRecord::new("file_events", now)
        .field("event_type", event_type)
        .field("file_path", file_path.as_str())
        .field("directory", directory)
        .subject(file_path.as_str())
        .dedup_key(file_path)
}

/// `age` is `None` when the path is gone, `Some(None)` when the platform
/// doesn't report creation time.
fn classify(age: Option<Option<Duration>>, fresh_within: Duration) -> &'static str {
    match age {
        None => "removed",
        Some(Some(age)) if age <= fresh_within => "created",
        Some(_) => "modified",
    }
}
