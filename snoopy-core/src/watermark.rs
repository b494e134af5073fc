//! Per-collector progress tokens
//!
//! A watermark marks the boundary between "already captured" and "not yet
//! captured" for one collector. Tokens are stored as tagged JSON in the
//! `collector_state` table of the event store, so advancing a watermark and
//! committing the events it covers happen in one transaction.
//!
//! Tokens only ever move forward. [`advance`] is the single place that
//! decides whether a candidate replaces the previous token.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque progress token, shaped by what the native source can offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Watermark {
    /// Monotonic row identifier (SQLite ROWID and friends)
    RowId { id: i64 },
    /// Modification or observation time, seconds since epoch
    Timestamp { ts: f64 },
    /// Append-only file position
    ByteOffset { offset: u64 },
    /// Timestamp with a tie-breaking id for sources with coarse clocks
    Composite { ts: f64, id: i64 },
}

/// The token shape a collector expects to find in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkKind {
    RowId,
    Timestamp,
    ByteOffset,
    Composite,
}

impl WatermarkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatermarkKind::RowId => "row_id",
            WatermarkKind::Timestamp => "timestamp",
            WatermarkKind::ByteOffset => "byte_offset",
            WatermarkKind::Composite => "composite",
        }
    }
}

impl std::fmt::Display for WatermarkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Watermark {
    pub fn kind(&self) -> WatermarkKind {
        match self {
            Watermark::RowId { .. } => WatermarkKind::RowId,
            Watermark::Timestamp { .. } => WatermarkKind::Timestamp,
            Watermark::ByteOffset { .. } => WatermarkKind::ByteOffset,
            Watermark::Composite { .. } => WatermarkKind::Composite,
        }
    }

    /// Strictly ahead of `other`. Tokens of different kinds never compare.
    pub fn is_ahead_of(&self, other: &Watermark) -> bool {
        match (self, other) {
            (Watermark::RowId { id: a }, Watermark::RowId { id: b }) => a > b,
            (Watermark::Timestamp { ts: a }, Watermark::Timestamp { ts: b }) => a > b,
            (Watermark::ByteOffset { offset: a }, Watermark::ByteOffset { offset: b }) => a > b,
            (
                Watermark::Composite { ts: a_ts, id: a_id },
                Watermark::Composite { ts: b_ts, id: b_id },
            ) => a_ts > b_ts || (a_ts == b_ts && a_id > b_id),
            _ => false,
        }
    }

    fn is_well_formed(&self) -> bool {
        match self {
            Watermark::Timestamp { ts } | Watermark::Composite { ts, .. } => ts.is_finite(),
            _ => true,
        }
    }

    /// Stable byte rendering used in natural keys.
    pub(crate) fn hash_into(&self, hasher: &mut Sha256) {
        match self {
            Watermark::RowId { id } => {
                hasher.update([1u8]);
                hasher.update(id.to_le_bytes());
            }
            Watermark::Timestamp { ts } => {
                hasher.update([2u8]);
                hasher.update(ts.to_bits().to_le_bytes());
            }
            Watermark::ByteOffset { offset } => {
                hasher.update([3u8]);
                hasher.update(offset.to_le_bytes());
            }
            Watermark::Composite { ts, id } => {
                hasher.update([4u8]);
                hasher.update(ts.to_bits().to_le_bytes());
                hasher.update(id.to_le_bytes());
            }
        }
    }

    /// Serialize for storage.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a stored token, checking it against the collector's expected kind.
    pub fn decode(collector: &str, raw: &str, expected: WatermarkKind) -> Result<Watermark> {
        let token: Watermark = serde_json::from_str(raw)
            .map_err(|e| Error::corrupt_watermark(collector, format!("unparseable token: {}", e)))?;

        if token.kind() != expected {
            return Err(Error::corrupt_watermark(
                collector,
                format!("expected {} token, found {}", expected, token.kind()),
            ));
        }
        if !token.is_well_formed() {
            return Err(Error::corrupt_watermark(collector, "non-finite timestamp"));
        }

        Ok(token)
    }
}

/// Monotonic merge: the candidate wins only if it is strictly ahead.
///
/// A candidate of a different kind than the previous token is rejected; the
/// previous token stays authoritative.
pub fn advance(previous: Option<&Watermark>, candidate: Watermark) -> Watermark {
    match previous {
        Some(prev) if !candidate.is_ahead_of(prev) => prev.clone(),
        _ => candidate,
    }
}

/// Persisted per-collector bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorState {
    /// Collector name (unique)
    pub name: String,
    /// Raw stored token; decode with [`Watermark::decode`]
    pub watermark: Option<String>,
    /// Last successful run (epoch seconds)
    pub last_run_at: Option<f64>,
    /// Consecutive failed ticks at last report
    pub consecutive_failures: u32,
}

impl CollectorState {
    /// Decode the stored token. Corrupt tokens decode to `None` with a warning,
    /// which makes the collector re-seed instead of skipping records.
    pub fn decoded_watermark(&self, expected: WatermarkKind) -> Option<Watermark> {
        let raw = self.watermark.as_deref()?;
        match Watermark::decode(&self.name, raw, expected) {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(
                    collector = %self.name,
                    error = %e,
                    "Ignoring corrupt watermark, collector will re-seed"
                );
                None
            }
        }
    }
}
