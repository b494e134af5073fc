//! Database layer for snoopy
//!
//! This module provides the storage layer using SQLite with:
//! - A fixed, allow-listed set of event tables
//! - Batched, all-or-nothing writes
//! - Durable per-collector watermarks committed alongside their events

pub mod repo;
pub mod schema;

pub use repo::{Database, HealthRecord, Rejection, WriteOutcome};
