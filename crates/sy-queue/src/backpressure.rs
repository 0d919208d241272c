//! Load classifier driving queue admission and dispatch pacing.
//!
//! The level is a pure function of (queued + in-flight) against the
//! configured watermarks; it is recomputed on every `update`, not
//! accumulated. Pausing dispatch and rejecting admissions are
//! independent knobs, not a fixed policy.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

/// Discrete load classification, least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    /// Load at which the level becomes elevated.
    pub low_watermark: usize,
    /// Load at which the level becomes high; critical at 1.5x this.
    pub high_watermark: usize,
    /// Pause dispatch while the level is high or critical.
    pub pause_on_high: bool,
    /// Reject new admissions while the level is critical.
    pub reject_on_critical: bool,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            low_watermark: 50,
            high_watermark: 100,
            pause_on_high: true,
            reject_on_critical: true,
        }
    }
}

type LevelCallback = Arc<dyn Fn(BackpressureLevel, BackpressureLevel) + Send + Sync>;

pub struct BackpressureController {
    config: BackpressureConfig,
    level: Mutex<BackpressureLevel>,
    on_change: Mutex<Option<LevelCallback>>,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            level: Mutex::new(BackpressureLevel::Normal),
            on_change: Mutex::new(None),
        }
    }

    /// Invoked exactly once per level transition with (previous, next);
    /// steady load at one level never re-fires it.
    pub fn on_level_change(
        &self,
        callback: impl Fn(BackpressureLevel, BackpressureLevel) + Send + Sync + 'static,
    ) {
        *self.on_change.lock() = Some(Arc::new(callback));
    }

    /// Classify `load` without touching the stored level.
    pub fn classify(&self, load: usize) -> BackpressureLevel {
        let critical_mark = (self.config.high_watermark as f64 * 1.5).ceil() as usize;
        if load >= critical_mark {
            BackpressureLevel::Critical
        } else if load >= self.config.high_watermark {
            BackpressureLevel::High
        } else if load >= self.config.low_watermark {
            BackpressureLevel::Elevated
        } else {
            BackpressureLevel::Normal
        }
    }

    /// Recompute the level from current queue depth and report it.
    pub fn update(&self, queued: usize, in_flight: usize) -> BackpressureLevel {
        let next = self.classify(queued + in_flight);

        let change = {
            let mut level = self.level.lock();
            if *level == next {
                None
            } else {
                let previous = *level;
                *level = next;
                Some((previous, self.on_change.lock().clone()))
            }
        };

        if let Some((previous, callback)) = change {
            info!(from = ?previous, to = ?next, queued, in_flight, "backpressure level change");
            if let Some(callback) = callback {
                callback(previous, next);
            }
        }

        next
    }

    pub fn level(&self) -> BackpressureLevel {
        *self.level.lock()
    }

    pub fn should_pause(&self) -> bool {
        self.config.pause_on_high && self.level() >= BackpressureLevel::High
    }

    pub fn should_reject(&self) -> bool {
        self.config.reject_on_critical && self.level() == BackpressureLevel::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> BackpressureConfig {
        BackpressureConfig {
            low_watermark: 5,
            high_watermark: 10,
            pause_on_high: true,
            reject_on_critical: true,
        }
    }

    #[test]
    fn classifies_against_watermarks() {
        let controller = BackpressureController::new(config());
        assert_eq!(controller.classify(4), BackpressureLevel::Normal);
        assert_eq!(controller.classify(7), BackpressureLevel::Elevated);
        assert_eq!(controller.classify(10), BackpressureLevel::High);
        assert_eq!(controller.classify(15), BackpressureLevel::Critical);
    }

    #[test]
    fn load_is_queued_plus_in_flight() {
        let controller = BackpressureController::new(config());
        assert_eq!(controller.update(3, 4), BackpressureLevel::Elevated);
        assert_eq!(controller.update(8, 7), BackpressureLevel::Critical);
    }

    #[test]
    fn callback_fires_once_per_transition() {
        let controller = BackpressureController::new(config());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        controller.on_level_change(move |_, _| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        controller.update(7, 0);
        controller.update(7, 0);
        controller.update(8, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1, "steady elevated fires once");

        controller.update(0, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pause_and_reject_are_independent_knobs() {
        let pause_only = BackpressureController::new(BackpressureConfig {
            reject_on_critical: false,
            ..config()
        });
        pause_only.update(20, 0);
        assert!(pause_only.should_pause());
        assert!(!pause_only.should_reject());

        let reject_only = BackpressureController::new(BackpressureConfig {
            pause_on_high: false,
            ..config()
        });
        reject_only.update(20, 0);
        assert!(!reject_only.should_pause());
        assert!(reject_only.should_reject());
    }
}
