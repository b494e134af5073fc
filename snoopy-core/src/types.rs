//! Core domain types for snoopy
//!
//! An [`Event`] is one normalized observation on its way to a domain table.
//! Events are transient: collectors create them, the buffer holds them, and
//! they are gone once the store commits them.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Collector** | Binds one raw native source to the event pipeline |
//! | **Event** | A normalized, table-targeted, timestamped observation |
//! | **Watermark** | Durable per-collector progress token (see [`crate::watermark`]) |
//! | **Natural key** | Stable hash of an event's origin and content, used to absorb replays |

use crate::watermark::Watermark;
use chrono::Utc;
use rusqlite::types::{ToSql, ToSqlOutput};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================
// Values
// ============================================

/// A single column value.
///
/// Mirrors SQLite's storage classes; booleans are stored as integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Stable byte rendering used for hashing. Tagged so `1` and `"1"` differ.
    fn hash_into(&self, hasher: &mut Sha256) {
        match self {
            Value::Null => hasher.update([0u8]),
            Value::Integer(i) => {
                hasher.update([1u8]);
                hasher.update(i.to_le_bytes());
            }
            Value::Real(f) => {
                hasher.update([2u8]);
                hasher.update(f.to_bits().to_le_bytes());
            }
            Value::Text(s) => {
                hasher.update([3u8]);
                hasher.update((s.len() as u64).to_le_bytes());
                hasher.update(s.as_bytes());
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Value::Null => Ok(ToSqlOutput::from(rusqlite::types::Null)),
            Value::Integer(i) => i.to_sql(),
            Value::Real(f) => f.to_sql(),
            Value::Text(s) => s.to_sql(),
        }
    }
}

// ============================================
// Events
// ============================================

/// A single captured observation destined for one domain table.
///
/// `timestamp` is observation time in seconds since the Unix epoch, never
/// write time. `columns` and `values` are parallel and ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Target table; checked against the fixed schema before any write
    pub table: String,
    /// Observation time (seconds since epoch, sub-second precision)
    pub timestamp: f64,
    /// Domain column names, in insertion order
    pub columns: Vec<String>,
    /// Values parallel to `columns`
    pub values: Vec<Value>,
    /// Where the source record sits in its source, when the source has positions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_position: Option<Watermark>,
}

impl Event {
    /// Start an event for `table` observed at `timestamp`.
    pub fn new(table: impl Into<String>, timestamp: f64) -> Self {
        Self {
            table: table.into(),
            timestamp,
            columns: Vec::new(),
            values: Vec::new(),
            source_position: None,
        }
    }

    /// Tie the event to its record's position in the source.
    pub fn at_position(mut self, position: Watermark) -> Self {
        self.source_position = Some(position);
        self
    }

    /// Append a column value (builder style).
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(column, value);
        self
    }

    /// Append a column value.
    pub fn push(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.columns.push(column.into());
        self.values.push(value.into());
    }

    /// Look up a column value by name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    /// Stable hash identifying this observation.
    ///
    /// Covers collector, table, timestamp, content and, when present, the
    /// source position. Re-reading the same source record yields the same key;
    /// two records with identical content at different positions do not.
    pub fn natural_key(&self, collector: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(collector.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.table.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.timestamp.to_bits().to_le_bytes());
        for (column, value) in self.columns.iter().zip(&self.values) {
            hasher.update(column.as_bytes());
            hasher.update([0u8]);
            value.hash_into(&mut hasher);
        }
        if let Some(position) = &self.source_position {
            hasher.update([0xffu8]);
            position.hash_into(&mut hasher);
        }
        hex::encode(hasher.finalize())
    }

    /// Content without timestamp or position, for state-change comparison.
    pub fn same_content(&self, other: &Event) -> bool {
        self.table == other.table && self.columns == other.columns && self.values == other.values
    }
}

// ============================================
// Time helpers
// ============================================

/// Current time as fractional seconds since the Unix epoch.
pub fn now_epoch() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Epoch seconds for `days` days before `now`.
pub fn days_before(now: f64, days: u32) -> f64 {
    now - f64::from(days) * 86_400.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = Event::new("window_events", 1_700_000_000.5)
            .with("app_name", "Terminal")
            .with("window_title", "zsh")
            .with("duration_s", 2.0);

        assert_eq!(event.columns, vec!["app_name", "window_title", "duration_s"]);
        assert_eq!(event.get("app_name"), Some(&Value::Text("Terminal".into())));
        assert_eq!(event.get("missing"), None);
    }

    #[test]
    fn test_natural_key_is_stable() {
        let a = Event::new("shell_events", 100.0).with("command", "ls");
        let b = Event::new("shell_events", 100.0).with("command", "ls");
        assert_eq!(a.natural_key("shell"), b.natural_key("shell"));
        assert_eq!(a.natural_key("shell").len(), 64);
    }

    #[test]
    fn test_natural_key_distinguishes_content() {
        let base = Event::new("shell_events", 100.0).with("command", "ls");
        let later = Event::new("shell_events", 100.5).with("command", "ls");
        let other = Event::new("shell_events", 100.0).with("command", "pwd");
        let typed = Event::new("shell_events", 100.0).with("command", 1i64);
        let typed_text = Event::new("shell_events", 100.0).with("command", "1");

        let key = base.natural_key("shell");
        assert_ne!(key, later.natural_key("shell"));
        assert_ne!(key, other.natural_key("shell"));
        assert_ne!(key, base.natural_key("other-collector"));
        assert_ne!(typed.natural_key("shell"), typed_text.natural_key("shell"));
    }

    #[test]
    fn test_natural_key_separates_repeated_records() {
        let first = Event::new("shell_events", 100.0)
            .with("command", "make test")
            .at_position(Watermark::ByteOffset { offset: 25 });
        let second = Event::new("shell_events", 100.0)
            .with("command", "make test")
            .at_position(Watermark::ByteOffset { offset: 50 });
        let reread = first.clone();
        let unpositioned = Event::new("shell_events", 100.0).with("command", "make test");

        assert_ne!(first.natural_key("shell"), second.natural_key("shell"));
        assert_eq!(first.natural_key("shell"), reread.natural_key("shell"));
        assert_ne!(first.natural_key("shell"), unpositioned.natural_key("shell"));
        assert!(first.same_content(&second));
    }

    #[test]
    fn test_option_and_bool_values() {
        let none: Option<&str> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
        assert_eq!(Value::from(true), Value::Integer(1));
    }

    #[test]
    fn test_days_before() {
        assert_eq!(days_before(200_000.0, 1), 200_000.0 - 86_400.0);
    }
}
