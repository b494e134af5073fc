//! Event-driven collectors
//!
//! An [`EventDrivenCollector`] wraps a [`PushSource`]. Records pass the
//! collector's exclusions inside the [`PushSink`], then arrive through a
//! bounded channel; the scheduler gathers them into coalescing windows and
//! hands each window to [`EventDrivenCollector::process`].

use super::source::{PushSink, PushSource, RawRecord};
use crate::config::Config;
use crate::error::Result;
use crate::filter::ExclusionFilter;
use crate::stats::PipelineStats;
use crate::types::Event;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Coalescing window used when neither the collector nor config sets one.
pub const DEFAULT_COALESCE: Duration = Duration::from_millis(1000);

/// Push channel depth used when the collector doesn't set one.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Records received during one coalescing window.
///
/// Records sharing a dedup key collapse to the latest arrival; survivors
/// keep arrival order.
#[derive(Debug, Default)]
pub struct Coalescer {
    /// Arrival slots; a slot is emptied when a later record replaces it
    slots: Vec<Option<RawRecord>>,
    by_key: HashMap<String, usize>,
    collapsed: usize,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: RawRecord) {
        let slot = self.slots.len();
        if let Some(key) = &record.dedup_key {
            if let Some(previous) = self.by_key.insert(key.clone(), slot) {
                self.slots[previous] = None;
                self.collapsed += 1;
            }
        }
        self.slots.push(Some(record));
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.collapsed
    }

    /// Take the window's survivors and how many records collapsed into them.
    pub fn take(&mut self) -> (Vec<RawRecord>, usize) {
        self.by_key.clear();
        let survivors = std::mem::take(&mut self.slots).into_iter().flatten().collect();
        (survivors, std::mem::take(&mut self.collapsed))
    }
}

/// A collector fed by native callbacks.
pub struct EventDrivenCollector {
    name: String,
    source: Box<dyn PushSource>,
    coalesce: Duration,
    channel_capacity: usize,
    filter: Arc<ExclusionFilter>,
}

impl EventDrivenCollector {
    pub fn new(name: impl Into<String>, source: Box<dyn PushSource>) -> Self {
        Self {
            name: name.into(),
            source,
            coalesce: DEFAULT_COALESCE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            filter: Arc::new(ExclusionFilter::default()),
        }
    }

    pub fn with_coalesce(mut self, window: Duration) -> Self {
        self.coalesce = window;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_filter(mut self, filter: ExclusionFilter) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    /// Apply `[filters]` and `[collectors.<name>]` settings.
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

        let mut collector = self.with_filter(filter);
        if let Some(ms) = overrides.coalesce_ms {
            collector.coalesce = Duration::from_millis(ms);
        }
        Ok(collector)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coalesce(&self) -> Duration {
        self.coalesce
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    pub fn setup(&mut self) -> Result<()> {
        self.source.setup()
    }

    /// Sink feeding `tx`, applying this collector's exclusions.
    pub fn sink(&self, tx: mpsc::Sender<RawRecord>, stats: Arc<PipelineStats>) -> PushSink {
        PushSink::new(&self.name, tx, stats).with_filter(Arc::clone(&self.filter))
    }

    pub fn subscribe(&mut self, sink: PushSink) -> Result<()> {
        self.source.subscribe(sink)
    }

    pub fn unsubscribe(&mut self) {
        self.source.unsubscribe()
    }

    /// Normalize one window's survivors.
    pub fn process(&self, records: Vec<RawRecord>) -> Vec<Event> {
        records.iter().map(RawRecord::to_event).collect()
    }
}
