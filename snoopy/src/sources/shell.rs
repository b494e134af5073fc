//! Zsh history adapter
//!
//! Reads `EXTENDED_HISTORY` entries (`: <start>:<elapsed>;<command>`) from
//! the history file. The cursor is the byte offset just past the last
//! complete entry, so a half-written trailing line is picked up on the next
//! poll rather than recorded truncated.

use snoopy_core::collector::{Poll, PollRequest, PollSource, RawRecord};
use snoopy_core::{Error, Result, Watermark, WatermarkKind};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub const NAME: &str = "shell";

/// Default poll interval in seconds
pub const INTERVAL_SECS: f64 = 10.0;

/// Longest malformed entry echoed into logs
const MALFORMED_PREVIEW: usize = 80;

pub struct ZshHistory {
    path: PathBuf,
}

impl ZshHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$HISTFILE`, else `~/.zsh_history`.
    pub fn from_env(home: &Path) -> Self {
        match std::env::var_os("HISTFILE") {
            Some(path) if !path.is_empty() => Self::new(path),
            _ => Self::new(home.join(".zsh_history")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_from(&self, offset: u64) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path).map_err(|e| self.io_error(e))?;
        let len = file.metadata()?.len();
        if len < offset {
            return Err(Error::corrupt_watermark(
                NAME,
                format!(
                    "{} shrank to {} bytes, cursor was at {}",
                    self.path.display(),
                    len,
                    offset
                ),
            ));
        }

        let mut bytes = Vec::with_capacity((len - offset) as usize);
        file.seek(SeekFrom::Start(offset))?;
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn io_error(&self, e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::NotFound => {
                Error::unavailable(NAME, format!("{} does not exist", self.path.display()))
            }
            io::ErrorKind::PermissionDenied => {
                Error::permission_denied(NAME, format!("cannot read {}", self.path.display()))
            }
            _ => Error::Io(e),
        }
    }
}

impl PollSource for ZshHistory {
    fn watermark_kind(&self) -> Option<WatermarkKind> {
        Some(WatermarkKind::ByteOffset)
    }

    fn poll(&mut self, request: &PollRequest) -> Result<Poll> {
        let offset = match request {
            PollRequest::Seed { .. } | PollRequest::Snapshot => 0,
            PollRequest::Since(Watermark::ByteOffset { offset }) => *offset,
            PollRequest::Since(other) => {
                return Err(Error::corrupt_watermark(
                    NAME,
                    format!("expected a byte offset, got {:?}", other),
                ))
            }
        };

        let bytes = self.read_from(offset)?;
        let parsed = parse_entries(&bytes, offset);

        let records = match request {
            PollRequest::Seed { since } => parsed
                .records
                .into_iter()
                .filter(|r| r.observed_at >= *since)
                .collect(),
            _ => parsed.records,
        };

        let poll = Poll {
            records,
            malformed: parsed.malformed,
            high_water: None,
        };
        Ok(if parsed.end > offset || matches!(request, PollRequest::Seed { .. }) {
            poll.with_high_water(Watermark::ByteOffset { offset: parsed.end })
        } else {
            poll
        })
    }
}

#[derive(Debug, Default)]
struct Parsed {
    records: Vec<RawRecord>,
    malformed: Vec<String>,
    /// Absolute offset just past the last complete entry
    end: u64,
}

/// Split `chunk` (read from absolute offset `base`) into history entries.
///
/// Lines ending in a backslash continue the entry on the next line. Anything
/// after the last newline is left for the next read.
fn parse_entries(chunk: &[u8], base: u64) -> Parsed {
    let mut parsed = Parsed {
        end: base,
        ..Parsed::default()
    };
    let mut entry = String::new();
    let mut start = 0;

    while let Some(newline) = chunk[start..].iter().position(|b| *b == b'\n') {
        let line_end = start + newline + 1;
        let line = String::from_utf8_lossy(&chunk[start..start + newline]);
        start = line_end;

        if let Some(continued) = line.strip_suffix('\\') {
            entry.push_str(continued);
            entry.push('\n');
            continue;
        }
        entry.push_str(&line);

        let position = base + line_end as u64;
        if !entry.trim().is_empty() {
            match parse_entry(&entry) {
                Some((started, elapsed, command)) => parsed.records.push(
                    RawRecord::new("shell_events", started)
                        .field("command", command)
                        .field("elapsed_seconds", elapsed)
                        .subject(program_name(command))
                        .position(Watermark::ByteOffset { offset: position }),
                ),
                None => parsed.malformed.push(preview(&entry)),
            }
        }
        entry.clear();
        parsed.end = position;
    }

    parsed
}

/// `: 1700000000:3;git status` -> (1700000000.0, 3.0, "git status")
fn parse_entry(entry: &str) -> Option<(f64, f64, &str)> {
    let rest = entry.strip_prefix(": ")?;
    let (meta, command) = rest.split_once(';')?;
    let (started, elapsed) = meta.split_once(':')?;
    if !is_digits(started) || !is_digits(elapsed) {
        return None;
    }
    Some((started.parse().ok()?, elapsed.parse().ok()?, command))
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// First word of a command, for name-based exclusions.
fn program_name(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or("")
}

fn preview(entry: &str) -> String {
    let mut end = entry.len().min(MALFORMED_PREVIEW);
    while !entry.is_char_boundary(end) {
        end -= 1;
    }
    entry[..end].to_string()
}
