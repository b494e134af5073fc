//! Error types for snoopy-core
//!
//! The capture pipeline handles almost every variant locally: collectors and
//! the scheduler log, count and carry on. Only failures to open the store
//! escape to the process exit code.

use thiserror::Error;

/// Main error type for the snoopy-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Native source is not running or not reachable right now
    #[error("source unavailable for {collector}: {reason}")]
    SourceUnavailable { collector: String, reason: String },

    /// Native source requires a grant the process lacks
    #[error("permission denied for {collector}: {reason}")]
    PermissionDenied { collector: String, reason: String },

    /// Adapter structure changed in a way the collector doesn't recognize
    #[error("schema drift in {collector}: {message}")]
    SchemaDrift { collector: String, message: String },

    /// Event targets a table or column outside the fixed schema
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// Store write failed after all retries
    #[error("write failure after {attempts} attempt(s): {message}")]
    WriteFailure { attempts: u32, message: String },

    /// Stored or reported watermark is unusable for its collector
    #[error("corrupt watermark for {collector}: {reason}")]
    CorruptWatermark { collector: String, reason: String },
}

impl Error {
    /// Shorthand for adapters reporting a missing source.
    pub fn unavailable(collector: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::SourceUnavailable {
            collector: collector.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for adapters reporting a missing permission grant.
    pub fn permission_denied(collector: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::PermissionDenied {
            collector: collector.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for adapters that detected their own cursor is no longer valid.
    pub fn corrupt_watermark(collector: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::CorruptWatermark {
            collector: collector.into(),
            reason: reason.into(),
        }
    }

    /// Whether the store itself can no longer be reached.
    ///
    /// Busy/locked databases are transient; a missing or unopenable file is not.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::NotADatabase
                    | rusqlite::ErrorCode::ReadOnly
            ),
            _ => false,
        }
    }
}

/// Result type alias for snoopy-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::unavailable("window", "no frontmost app");
        assert_eq!(
            err.to_string(),
            "source unavailable for window: no frontmost app"
        );

        let err = Error::SchemaViolation("unknown table 'bogus'".to_string());
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_busy_is_not_fatal() {
        let busy = Error::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(!busy.is_fatal());

        let cant_open = Error::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
            None,
        ));
        assert!(cant_open.is_fatal());
    }
}
