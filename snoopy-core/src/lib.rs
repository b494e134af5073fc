//! # snoopy-core
//!
//! Core library for snoopy - a background daemon that captures local
//! activity into a durable, de-duplicated SQLite event log.
//!
//! This library provides:
//! - Collectors that wrap raw source adapters (polled or event-driven)
//! - Per-collector watermarks that survive restarts
//! - A bounded event buffer flushed in batched transactions
//! - A scheduler that isolates failing collectors from each other
//! - Configuration and logging infrastructure
//!
//! ## Data flow
//!
//! Scheduler tick → collector asks its adapter for records since its
//! watermark → exclusion filter and dedup → buffer → flush commits events
//! and advances watermarks in one transaction.
//!
//! ## Example
//!
//! ```rust,no_run
//! use snoopy_core::{Config, Database};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open database
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//! ```

// Re-export commonly used items at the crate root
pub use buffer::{Batch, BatchWriter, EventBuffer, FlushReport, Flusher, RetryPolicy};
pub use collector::{
    Collector, EventDrivenCollector, Poll, PollRequest, PollSource, PolledCollector, PushSink,
    PushSource, RawRecord,
};
pub use config::Config;
pub use db::{Database, WriteOutcome};
pub use error::{Error, Result};
pub use scheduler::{RunReport, Scheduler, SchedulerHandle};
pub use stats::{PipelineStats, StatsSnapshot};
pub use types::*;
pub use watermark::{Watermark, WatermarkKind};

// Public modules
pub mod buffer;
pub mod collector;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod filter;
pub mod logging;
pub mod scheduler;
pub mod stats;
pub mod types;
pub mod watermark;
