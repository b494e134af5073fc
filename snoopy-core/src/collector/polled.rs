//! Polled collectors
//!
//! A [`PolledCollector`] turns one [`PollSource`] answer into events ready
//! for the buffer: it chooses seed or incremental requests from the current
//! watermark, drops excluded and unchanged records, and computes the next
//! watermark. It holds no durable state of its own.

use super::source::{Poll, PollRequest, PollSource, RawRecord};
use crate::config::Config;
use crate::dedup::Deduplicator;
use crate::error::{Error, Result};
use crate::filter::ExclusionFilter;
use crate::types::{days_before, Event};
use crate::watermark::{advance, Watermark, WatermarkKind};
use std::time::Duration;

/// Seed window used when neither the collector nor config sets one.
pub const DEFAULT_SEED_DAYS: u32 = 7;

/// Result of one `collect` call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickOutput {
    /// Events in observation order
    pub events: Vec<Event>,
    /// Watermark after this tick; never behind the one passed in
    pub watermark: Option<Watermark>,
    /// Records dropped by the exclusion filter
    pub excluded: usize,
    /// Records suppressed as unchanged state
    pub deduplicated: usize,
    /// Records the adapter could not shape
    pub malformed: usize,
}

/// A collector driven by a fixed interval.
pub struct PolledCollector {
    name: String,
    source: Box<dyn PollSource>,
    interval: Duration,
    seed_days: u32,
    filter: ExclusionFilter,
    dedup: Deduplicator,
}

impl PolledCollector {
    pub fn new(name: impl Into<String>, source: Box<dyn PollSource>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            source,
            interval,
            seed_days: DEFAULT_SEED_DAYS,
            filter: ExclusionFilter::default(),
            dedup: Deduplicator::new(None),
        }
    }

    pub fn with_seed_days(mut self, days: u32) -> Self {
        self.seed_days = days;
        self
    }

    pub fn with_filter(mut self, filter: ExclusionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_dedup_window(mut self, window: Option<Duration>) -> Self {
        self.dedup = Deduplicator::new(window);
        self
    }

    /// Apply `[filters]` and `[collectors.<name>]` settings on top of the
    /// collector's built-in defaults.
    pub fn configure(
        self,
        config: &Config,
        builtin_names: &[&str],
        builtin_paths: &[&str],
    ) -> Result<Self> {
        let overrides = config.collector(&self.name);
        let filter = ExclusionFilter::from_config(
            &config.filters,
            &overrides,
            builtin_names,
            builtin_paths,
        )?;

        let mut collector = self
            .with_filter(filter)
            .with_dedup_window(overrides.dedup_window_secs.map(Duration::from_secs_f64));
        if let Some(interval) = overrides.interval_secs {
            collector.interval = Duration::from_secs_f64(interval);
        }
        if let Some(days) = overrides.seed_days {
            collector.seed_days = days;
        }
        Ok(collector)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn seed_days(&self) -> u32 {
        self.seed_days
    }

    pub fn watermark_kind(&self) -> Option<WatermarkKind> {
        self.source.watermark_kind()
    }

    pub fn setup(&mut self) -> Result<()> {
        self.source.setup()
    }

    pub fn teardown(&mut self) {
        self.source.teardown()
    }

    /// Forget dedup state, e.g. after the source was reset.
    pub fn reset(&mut self) {
        self.dedup.clear();
    }

    /// Run one poll against the adapter.
    ///
    /// `watermark` is the collector's current cursor (`None` = never run).
    /// `now` anchors the seed window.
    pub fn collect(&mut self, watermark: Option<&Watermark>, now: f64) -> Result<TickOutput> {
        let request = match (self.source.watermark_kind(), watermark) {
            (None, _) => PollRequest::Snapshot,
            (Some(_), None) => PollRequest::Seed {
                since: days_before(now, self.seed_days),
            },
            (Some(_), Some(current)) => PollRequest::Since(current.clone()),
        };

        let poll = self.source.poll(&request)?;
        Ok(self.process(&request, watermark, poll))
    }

    fn process(
        &mut self,
        request: &PollRequest,
        previous: Option<&Watermark>,
        poll: Poll,
    ) -> TickOutput {
        let mut output = TickOutput {
            malformed: poll.malformed.len(),
            ..TickOutput::default()
        };

        if !poll.malformed.is_empty() {
            let drift = Error::SchemaDrift {
                collector: self.name.clone(),
                message: format!(
                    "{} malformed record(s), first: {}",
                    poll.malformed.len(),
                    poll.malformed[0]
                ),
            };
            tracing::warn!(collector = %self.name, error = %drift, "Skipping malformed records");
        }

        let mut records = poll.records;
        records.sort_by(|a, b| a.observed_at.total_cmp(&b.observed_at));

        let mut candidate = poll.high_water;
        for record in records {
            if let Some(position) = &record.position {
                candidate = Some(match candidate {
                    Some(current) if !position.is_ahead_of(&current) => current,
                    _ => position.clone(),
                });
            }

            if !self.in_range(request, &record) {
                continue;
            }

            if self.filter.is_excluded(&record.subjects) {
                tracing::debug!(collector = %self.name, subjects = ?record.subjects, "Excluded record");
                output.excluded += 1;
                continue;
            }

            let event = record.to_event();
            if let Some(key) = &record.dedup_key {
                if !self.dedup.admit(key, &event) {
                    output.deduplicated += 1;
                    continue;
                }
            }
            output.events.push(event);
        }

        output.watermark = match candidate {
            Some(candidate) => Some(advance(previous, candidate)),
            None => previous.cloned(),
        };
        output
    }

    /// Guard against adapters that return more than was asked for.
    fn in_range(&self, request: &PollRequest, record: &RawRecord) -> bool {
        match request {
            PollRequest::Seed { since } => record.observed_at >= *since,
            PollRequest::Since(current) => record
                .position
                .as_ref()
                .map_or(true, |position| position.is_ahead_of(current)),
            PollRequest::Snapshot => true,
        }
    }
}
