//! Bounded rolling windows.
//!
//! `TimestampWindow` backs sliding failure-count decisions (entries are
//! pruned against a fixed age). `SampleWindow` backs rolling latency
//! averages (most-recent N samples).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Timestamps of recent events, pruned against a fixed age window and
/// capped so a failure storm cannot grow the list without bound.
#[derive(Debug)]
pub struct TimestampWindow {
    window: Duration,
    max_entries: usize,
    entries: VecDeque<Instant>,
}

impl TimestampWindow {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            window,
            max_entries,
            entries: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: Instant) {
        self.prune(at);
        if self.entries.len() == self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(at);
    }

    /// Drop entries older than the window, measured from `now`.
    pub fn prune(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(*front) > self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Surviving entry count after pruning against `now`.
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Applies to future pruning only; existing entries are re-evaluated
    /// on the next `prune`.
    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }
}

/// Most-recent-N numeric samples with a rolling average.
#[derive(Debug)]
pub struct SampleWindow {
    cap: usize,
    samples: VecDeque<u64>,
}

impl SampleWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            samples: VecDeque::with_capacity(cap),
        }
    }

    pub fn record(&mut self, sample: u64) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_window_prunes_by_age() {
        let mut window = TimestampWindow::new(Duration::from_secs(60), 100);
        let start = Instant::now();

        window.record(start);
        window.record(start + Duration::from_secs(30));
        window.record(start + Duration::from_secs(90));

        // At t=95s the t=0 entry has aged out, the others survive.
        assert_eq!(window.count(start + Duration::from_secs(95)), 2);
        // At t=200s everything has aged out.
        assert_eq!(window.count(start + Duration::from_secs(200)), 0);
    }

    #[test]
    fn timestamp_window_is_capped() {
        let mut window = TimestampWindow::new(Duration::from_secs(3600), 3);
        let start = Instant::now();

        for i in 0..10 {
            window.record(start + Duration::from_secs(i));
        }

        assert_eq!(window.count(start + Duration::from_secs(10)), 3);
    }

    #[test]
    fn sample_window_keeps_most_recent() {
        let mut window = SampleWindow::new(3);
        assert_eq!(window.average(), 0.0);

        for sample in [10, 20, 30, 40] {
            window.record(sample);
        }

        // 10 was evicted; average of 20, 30, 40.
        assert_eq!(window.len(), 3);
        assert_eq!(window.average(), 30.0);
    }
}
