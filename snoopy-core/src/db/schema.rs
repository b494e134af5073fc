//! Database schema and migrations
//!
//! Every event table is declared once in [`EVENT_TABLES`]. The DDL, the
//! table allow-list, and the per-table column allow-list all derive from
//! that declaration, so the write path cannot drift from the schema.
//!
//! Each event table carries:
//! - `id` (assigned at write time, reflects flush order, not observation order)
//! - `timestamp` (observation time, indexed)
//! - `natural_key` (unique; absorbs replays after a crash)
//! - domain columns
//!
//! Schema version is tracked via PRAGMA user_version.

use crate::error::{Error, Result};
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Declaration of one event domain table.
#[derive(Debug)]
pub struct TableDef {
    pub name: &'static str,
    /// Domain columns as (name, SQL type)
    pub columns: &'static [(&'static str, &'static str)],
    /// Correlation columns that get their own index
    pub indexed: &'static [&'static str],
}

impl TableDef {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|(name, _)| *name == column)
    }

    fn ddl(&self) -> String {
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    id INTEGER PRIMARY KEY,\n    timestamp REAL NOT NULL,\n    natural_key TEXT NOT NULL UNIQUE",
            self.name
        );
        for (column, ty) in self.columns {
            sql.push_str(&format!(",\n    {} {}", column, ty));
        }
        sql.push_str("\n);\n");
        sql.push_str(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{0}_timestamp ON {0}(timestamp);\n",
            self.name
        ));
        for column in self.indexed {
            sql.push_str(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_{1} ON {0}({1});\n",
                self.name, column
            ));
        }
        sql
    }
}

/// The fixed set of event tables. Anything else is a schema violation.
pub const EVENT_TABLES: &[TableDef] = &[
    TableDef {
        name: "window_events",
        columns: &[
            ("app_name", "TEXT"),
            ("window_title", "TEXT"),
            ("bundle_id", "TEXT"),
            ("duration_s", "REAL"),
            ("keyboard_idle_s", "REAL"),
            ("mouse_idle_s", "REAL"),
            ("display_id", "TEXT"),
        ],
        indexed: &["bundle_id"],
    },
    TableDef {
        name: "idle_events",
        columns: &[("idle_seconds", "REAL"), ("is_idle", "INTEGER")],
        indexed: &[],
    },
    TableDef {
        name: "media_events",
        columns: &[
            ("title", "TEXT"),
            ("artist", "TEXT"),
            ("album", "TEXT"),
            ("app_source", "TEXT"),
            ("is_playing", "INTEGER"),
        ],
        indexed: &[],
    },
    TableDef {
        name: "browser_events",
        columns: &[
            ("url", "TEXT"),
            ("title", "TEXT"),
            ("browser", "TEXT"),
            ("visit_id", "INTEGER"),
            ("visit_duration_s", "REAL"),
        ],
        indexed: &["url"],
    },
    TableDef {
        name: "shell_events",
        columns: &[("command", "TEXT"), ("elapsed_seconds", "REAL")],
        indexed: &[],
    },
    TableDef {
        name: "wifi_events",
        columns: &[("ssid", "TEXT"), ("bssid", "TEXT")],
        indexed: &[],
    },
    TableDef {
        name: "clipboard_events",
        columns: &[
            ("content_text", "TEXT"),
            ("content_type", "TEXT"),
            ("source_app", "TEXT"),
        ],
        indexed: &[],
    },
    TableDef {
        name: "file_events",
        columns: &[
            ("event_type", "TEXT"),
            ("file_path", "TEXT"),
            ("directory", "TEXT"),
        ],
        indexed: &["file_path"],
    },
    TableDef {
        name: "network_events",
        columns: &[
            ("process_name", "TEXT"),
            ("protocol", "TEXT"),
            ("remote_address", "TEXT"),
            ("remote_port", "INTEGER"),
        ],
        indexed: &[],
    },
    TableDef {
        name: "location_events",
        columns: &[
            ("latitude", "REAL"),
            ("longitude", "REAL"),
            ("accuracy_m", "REAL"),
            ("altitude_m", "REAL"),
            ("source", "TEXT"),
        ],
        indexed: &[],
    },
    TableDef {
        name: "notification_events",
        columns: &[
            ("app_name", "TEXT"),
            ("content_preview", "TEXT"),
            ("response_latency_s", "REAL"),
        ],
        indexed: &[],
    },
    TableDef {
        name: "audio_events",
        columns: &[
            ("device_type", "TEXT"),
            ("is_active", "INTEGER"),
            ("process_name", "TEXT"),
        ],
        indexed: &[],
    },
    TableDef {
        name: "message_events",
        columns: &[
            ("message_id", "INTEGER"),
            ("contact", "TEXT"),
            ("is_from_me", "INTEGER"),
            ("content_preview", "TEXT"),
            ("has_attachment", "INTEGER"),
            ("service", "TEXT"),
            ("chat_name", "TEXT"),
        ],
        indexed: &["chat_name"],
    },
    TableDef {
        name: "mail_events",
        columns: &[
            ("message_id", "INTEGER"),
            ("sender", "TEXT"),
            ("subject", "TEXT"),
            ("mailbox", "TEXT"),
            ("is_read", "INTEGER"),
            ("is_flagged", "INTEGER"),
        ],
        indexed: &["message_id"],
    },
    TableDef {
        name: "system_events",
        columns: &[("event_type", "TEXT"), ("details", "TEXT")],
        indexed: &[],
    },
    TableDef {
        name: "app_events",
        columns: &[
            ("event_type", "TEXT"),
            ("app_name", "TEXT"),
            ("bundle_id", "TEXT"),
        ],
        indexed: &["app_name"],
    },
    TableDef {
        name: "battery_events",
        columns: &[
            ("percent", "INTEGER"),
            ("is_charging", "INTEGER"),
            ("power_source", "TEXT"),
        ],
        indexed: &[],
    },
    TableDef {
        name: "calendar_events",
        columns: &[
            ("event_uid", "TEXT"),
            ("title", "TEXT"),
            ("calendar_name", "TEXT"),
            ("start_time", "TEXT"),
            ("end_time", "TEXT"),
            ("location", "TEXT"),
            ("attendees", "TEXT"),
            ("is_all_day", "INTEGER"),
            ("is_recurring", "INTEGER"),
            ("status", "TEXT"),
        ],
        indexed: &["event_uid"],
    },
];

/// Bookkeeping tables that never receive events.
const INTERNAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS collector_state (
    collector_name       TEXT PRIMARY KEY,
    last_watermark       TEXT,
    last_run_timestamp   REAL,
    consecutive_failures INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS daemon_health (
    id         INTEGER PRIMARY KEY,
    timestamp  REAL NOT NULL,
    event_type TEXT NOT NULL,
    details    TEXT
);
CREATE INDEX IF NOT EXISTS idx_daemon_health_timestamp ON daemon_health(timestamp);
"#;

/// Look up an event table by name.
pub fn event_table(name: &str) -> Option<&'static TableDef> {
    EVENT_TABLES.iter().find(|t| t.name == name)
}

/// Idempotent "create if absent" for every known table.
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    let mut sql = String::from(INTERNAL_SCHEMA);
    for table in EVENT_TABLES {
        sql.push_str(&table.ddl());
    }
    conn.execute_batch(&sql)?;
    Ok(())
}

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    if current_version > SCHEMA_VERSION {
        return Err(Error::Config(format!(
            "database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    // Always re-apply: newly declared tables appear without a version bump.
    ensure_schema(conn)?;

    if current_version < SCHEMA_VERSION {
        conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
