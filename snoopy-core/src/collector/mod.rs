//! Collectors
//!
//! A collector binds one raw source adapter to the capture pipeline. It comes
//! in two shapes, dispatched by the scheduler:
//!
//! - [`Collector::Polled`]: sampled on a fixed interval, optionally with a
//!   watermark protocol (seed window on first run, strictly-after reads
//!   afterwards) and state-change dedup.
//! - [`Collector::EventDriven`]: always listening; pushed records are
//!   filtered as they arrive and coalesced over a short window before they
//!   enter the buffer.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use snoopy_core::collector::{Collector, PolledCollector};
//!
//! let shell = PolledCollector::new("shell", Box::new(ZshHistory::default()), interval)
//!     .configure(&config, &[], &[])?;
//! let registry = vec![Collector::Polled(shell)];
//! ```

mod event_driven;
mod polled;
mod source;

pub use event_driven::{Coalescer, EventDrivenCollector, DEFAULT_CHANNEL_CAPACITY, DEFAULT_COALESCE};
pub use polled::{PolledCollector, TickOutput, DEFAULT_SEED_DAYS};
pub use source::{Poll, PollRequest, PollSource, PushSink, PushSource, RawRecord};

/// A registered collector.
pub enum Collector {
    Polled(PolledCollector),
    EventDriven(EventDrivenCollector),
}

impl Collector {
    pub fn name(&self) -> &str {
        match self {
            Collector::Polled(c) => c.name(),
            Collector::EventDriven(c) => c.name(),
        }
    }

    pub fn is_polled(&self) -> bool {
        matches!(self, Collector::Polled(_))
    }
}

impl From<PolledCollector> for Collector {
    fn from(collector: PolledCollector) -> Self {
        Collector::Polled(collector)
    }
}

impl From<EventDrivenCollector> for Collector {
    fn from(collector: EventDrivenCollector) -> Self {
        Collector::EventDriven(collector)
    }
}
