//! State-change de-duplication
//!
//! Polled sources often report the same state tick after tick (the same
//! frontmost window, the same Wi-Fi network). [`Deduplicator`] remembers the
//! last emitted event per logical key and only lets a changed one through.

use crate::types::Event;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug)]
struct Seen {
    event: Event,
    emitted_at: f64,
}

/// Last-emitted state per logical key.
#[derive(Debug, Default)]
pub struct Deduplicator {
    last: HashMap<String, Seen>,
    window: Option<Duration>,
}

impl Deduplicator {
    /// `window` re-admits an unchanged state once it has elapsed since the
    /// last emission; `None` means pure state-change detection.
    pub fn new(window: Option<Duration>) -> Self {
        Self {
            last: HashMap::new(),
            window,
        }
    }

    /// Decide whether `event` under `key` should be emitted.
    ///
    /// Comparison ignores the timestamp, so a run of identical observations
    /// keeps the first one's timestamp. A → B → A emits all three.
    pub fn admit(&mut self, key: &str, event: &Event) -> bool {
        if let Some(seen) = self.last.get(key) {
            if seen.event.same_content(event) {
                let expired = self
                    .window
                    .is_some_and(|w| event.timestamp - seen.emitted_at >= w.as_secs_f64());
                if !expired {
                    return false;
                }
            }
        }

        self.last.insert(
            key.to_string(),
            Seen {
                event: event.clone(),
                emitted_at: event.timestamp,
            },
        );
        true
    }

    /// Drop all remembered state (e.g. after the source was reset).
    pub fn clear(&mut self) {
        self.last.clear();
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(app: &str, ts: f64) -> Event {
        Event::new("window_events", ts).with("app_name", app)
    }

    #[test]
    fn test_repeated_state_emits_once() {
        let mut dedup = Deduplicator::new(None);
        let emitted: Vec<f64> = [("A", 1.0), ("A", 2.0), ("A", 3.0), ("B", 4.0)]
            .into_iter()
            .map(|(app, ts)| window(app, ts))
            .filter(|e| dedup.admit("front", e))
            .map(|e| e.timestamp)
            .collect();

        assert_eq!(emitted, vec![1.0, 4.0]);
    }

    #[test]
    fn test_revert_emits_again() {
        let mut dedup = Deduplicator::new(None);
        assert!(dedup.admit("front", &window("A", 1.0)));
        assert!(dedup.admit("front", &window("B", 2.0)));
        assert!(dedup.admit("front", &window("A", 3.0)));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut dedup = Deduplicator::new(None);
        assert!(dedup.admit("display-1", &window("A", 1.0)));
        assert!(dedup.admit("display-2", &window("A", 1.0)));
        assert!(!dedup.admit("display-1", &window("A", 2.0)));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_window_reemits_unchanged_state() {
        let mut dedup = Deduplicator::new(Some(Duration::from_secs(60)));
        assert!(dedup.admit("front", &window("A", 0.0)));
        assert!(!dedup.admit("front", &window("A", 30.0)));
        assert!(dedup.admit("front", &window("A", 60.0)));
        assert!(!dedup.admit("front", &window("A", 90.0)));
    }

    #[test]
    fn test_clear_forgets_state() {
        let mut dedup = Deduplicator::new(None);
        assert!(dedup.admit("front", &window("A", 1.0)));
        dedup.clear();
        assert!(dedup.is_empty());
        assert!(dedup.admit("front", &window("A", 2.0)));
    }
}
