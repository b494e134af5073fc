//! Database repository layer
//!
//! The event store is written only through [`Database::write_batch`]: one
//! transaction per flush, covering every buffered event and the watermark
//! advancement of every collector that contributed to the batch.

use super::schema::{self, event_table};
use crate::buffer::{Batch, BatchWriter, PendingEvent, Progress};
use crate::error::{Error, Result};
use crate::types::now_epoch;
use crate::watermark::{advance, CollectorState, Watermark, WatermarkKind};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// An event that failed validation and was never written.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// Collector that produced the event
    pub collector: String,
    /// Table the event claimed
    pub table: String,
    /// Why it was rejected
    pub reason: String,
}

/// Result of one committed batch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Rows inserted
    pub inserted: usize,
    /// Events whose natural key was already present
    pub duplicates: usize,
    /// Events dropped before the transaction
    pub rejected: Vec<Rejection>,
    /// Collectors whose stored watermark moved forward
    pub watermarks_advanced: Vec<String>,
}

/// A `daemon_health` row.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthRecord {
    pub timestamp: f64,
    pub event_type: String,
    pub details: Option<String>,
}

/// Database handle with connection pooling (single connection for now)
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL so status readers never block the flusher
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA cache_size = -8000;  -- 8MB cache
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Path of the backing file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection();
        schema::run_migrations(&conn)
    }

    /// Idempotent create-if-absent for every known table
    pub fn ensure_schema(&self) -> Result<()> {
        let conn = self.connection();
        schema::ensure_schema(&conn)
    }

    /// Get the underlying connection (for advanced use)
    ///
    /// A panic while holding the lock cannot leave SQLite half-written (the
    /// transaction rolls back on drop), so a poisoned lock is still usable.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ============================================
    // Batch writes
    // ============================================

    /// Write a batch atomically.
    ///
    /// Events are validated against the fixed schema first; rejected events
    /// never enter the transaction. Valid events are inserted grouped by
    /// table (per-collector order preserved within a table), then every
    /// contributing collector's progress is recorded in the same commit.
    pub fn write_batch(&self, batch: &Batch) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();

        let mut by_table: BTreeMap<&str, Vec<&PendingEvent>> = BTreeMap::new();
        for pending in &batch.events {
            match validate(pending) {
                Ok(()) => by_table
                    .entry(pending.event.table.as_str())
                    .or_default()
                    .push(pending),
                Err(reason) => {
                    tracing::error!(
                        collector = %pending.collector,
                        table = %pending.event.table,
                        reason = %reason,
                        "Schema violation, event dropped"
                    );
                    outcome.rejected.push(Rejection {
                        collector: pending.collector.clone(),
                        table: pending.event.table.clone(),
                        reason,
                    });
                }
            }
        }

        let mut conn = self.connection();
        let tx = conn.transaction()?;

        for (table, events) in &by_table {
            for pending in events {
                if insert_event(&tx, table, pending)? {
                    outcome.inserted += 1;
                } else {
                    outcome.duplicates += 1;
                }
            }
        }

        for (collector, progress) in &batch.progress {
            if record_progress(&tx, collector, progress)? {
                outcome.watermarks_advanced.push(collector.clone());
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    // ============================================
    // Watermark operations
    // ============================================

    /// Raw stored token for a collector
    pub fn get_watermark(&self, collector: &str) -> Result<Option<String>> {
        let conn = self.connection();
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT last_watermark FROM collector_state WHERE collector_name = ?",
                [collector],
                |r| r.get(0),
            )
            .optional()?;
        Ok(raw.flatten())
    }

    /// Decoded token for a collector; corrupt tokens load as `None`.
    pub fn load_watermark(&self, collector: &str, kind: WatermarkKind) -> Result<Option<Watermark>> {
        Ok(self
            .collector_state(collector)?
            .and_then(|state| state.decoded_watermark(kind)))
    }

    /// Clear a collector's watermark so its next run re-seeds.
    ///
    /// Only for detected corruption; normal operation never moves a
    /// watermark backwards.
    pub fn reset_watermark(&self, collector: &str) -> Result<()> {
        let conn = self.connection();
        conn.execute(
            "UPDATE collector_state SET last_watermark = NULL WHERE collector_name = ?",
            [collector],
        )?;
        tracing::warn!(collector = %collector, "Watermark reset");
        Ok(())
    }

    /// Persist the consecutive-failure count.
    ///
    /// State rows are created by the first successful run, so this is a
    /// no-op for collectors that never succeeded.
    pub fn record_failures(&self, collector: &str, consecutive: u32) -> Result<()> {
        let conn = self.connection();
        conn.execute(
            "UPDATE collector_state SET consecutive_failures = ?2 WHERE collector_name = ?1",
            params![collector, consecutive],
        )?;
        Ok(())
    }

    /// State row for one collector
    pub fn collector_state(&self, collector: &str) -> Result<Option<CollectorState>> {
        let conn = self.connection();
        conn.query_row(
            "SELECT * FROM collector_state WHERE collector_name = ?",
            [collector],
            Self::row_to_collector_state,
        )
        .optional()
        .map_err(Error::from)
    }

    /// All collector states, by name
    pub fn list_collector_states(&self) -> Result<Vec<CollectorState>> {
        let conn = self.connection();
        let mut stmt = conn.prepare("SELECT * FROM collector_state ORDER BY collector_name")?;
        let rows = stmt.query_map([], Self::row_to_collector_state)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    fn row_to_collector_state(row: &Row) -> rusqlite::Result<CollectorState> {
        Ok(CollectorState {
            name: row.get("collector_name")?,
            watermark: row.get("last_watermark")?,
            last_run_at: row.get("last_run_timestamp")?,
            consecutive_failures: row.get("consecutive_failures")?,
        })
    }

    // ============================================
    // Health and inspection
    // ============================================

    /// Record a daemon lifecycle event (startup, heartbeat, shutdown).
    pub fn log_health(&self, event_type: &str, details: &str) -> Result<()> {
        let conn = self.connection();
        conn.execute(
            "INSERT INTO daemon_health (timestamp, event_type, details) VALUES (?1, ?2, ?3)",
            params![now_epoch(), event_type, details],
        )?;
        Ok(())
    }

    /// Most recent health rows, newest first
    pub fn recent_health(&self, limit: usize) -> Result<Vec<HealthRecord>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT timestamp, event_type, details FROM daemon_health ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(HealthRecord {
                timestamp: row.get(0)?,
                event_type: row.get(1)?,
                details: row.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Row count for one event table
    pub fn count(&self, table: &str) -> Result<i64> {
        let def = event_table(table)
            .ok_or_else(|| Error::SchemaViolation(format!("unknown table '{}'", table)))?;
        let conn = self.connection();
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {}", def.name), [], |r| {
            r.get(0)
        })?;
        Ok(count)
    }

    /// Row counts for every event table, in schema order
    pub fn table_counts(&self) -> Result<Vec<(&'static str, i64)>> {
        schema::EVENT_TABLES
            .iter()
            .map(|def| Ok((def.name, self.count(def.name)?)))
            .collect()
    }
}

impl BatchWriter for Database {
    fn write_batch(&self, batch: &Batch) -> Result<WriteOutcome> {
        Database::write_batch(self, batch)
    }

    fn reset_progress(&self, collector: &str) -> Result<()> {
        self.reset_watermark(collector)
    }
}

/// Check an event against the fixed table and column allow-lists.
fn validate(pending: &PendingEvent) -> std::result::Result<(), String> {
    let event = &pending.event;
    let def = event_table(&event.table)
        .ok_or_else(|| format!("unknown table '{}'", event.table))?;

    if event.columns.len() != event.values.len() {
        return Err(format!(
            "{} columns but {} values",
            event.columns.len(),
            event.values.len()
        ));
    }
    if !event.timestamp.is_finite() {
        return Err("non-finite timestamp".to_string());
    }
    for (i, column) in event.columns.iter().enumerate() {
        if !def.has_column(column) {
            return Err(format!("unknown column '{}' for table '{}'", column, def.name));
        }
        if event.columns[..i].contains(column) {
            return Err(format!("duplicate column '{}'", column));
        }
    }
    Ok(())
}

/// Insert one validated event. Returns false when the natural key already exists.
fn insert_event(tx: &Transaction<'_>, table: &str, pending: &PendingEvent) -> Result<bool> {
    let event = &pending.event;
    let mut columns = String::from("timestamp, natural_key");
    let mut placeholders = String::from("?1, ?2");
    for (i, column) in event.columns.iter().enumerate() {
        columns.push_str(", ");
        columns.push_str(column);
        placeholders.push_str(&format!(", ?{}", i + 3));
    }
    let sql = format!(
        "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
        table, columns, placeholders
    );

    let natural_key = event.natural_key(&pending.collector);
    let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(event.values.len() + 2);
    params.push(&event.timestamp);
    params.push(&natural_key);
    for value in &event.values {
        params.push(value);
    }

    let mut stmt = tx.prepare_cached(&sql)?;
    let changed = stmt.execute(params.as_slice())?;
    Ok(changed > 0)
}

/// Upsert a collector's state row, advancing its watermark monotonically.
///
/// Returns true if the stored watermark changed.
fn record_progress(tx: &Transaction<'_>, collector: &str, progress: &Progress) -> Result<bool> {
    let stored: Option<Option<String>> = tx
        .query_row(
            "SELECT last_watermark FROM collector_state WHERE collector_name = ?",
            [collector],
            |r| r.get(0),
        )
        .optional()?;
    let stored = stored.flatten();

    let next = match &progress.watermark {
        Some(candidate) => {
            let previous = stored
                .as_deref()
                .and_then(|raw| Watermark::decode(collector, raw, candidate.kind()).ok());
            let next = advance(previous.as_ref(), candidate.clone());
            if previous.as_ref() == Some(&next) {
                None
            } else {
                Some(next.encode()?)
            }
        }
        None => None,
    };

    tx.execute(
        r#"
        INSERT INTO collector_state (collector_name, last_watermark, last_run_timestamp)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(collector_name) DO UPDATE SET
            last_watermark = COALESCE(excluded.last_watermark, last_watermark),
            last_run_timestamp = MAX(COALESCE(last_run_timestamp, 0), excluded.last_run_timestamp)
        "#,
        params![collector, next, progress.last_run_at],
    )?;

    Ok(next.is_some())
}
