//! Registry of named queues.
//!
//! Queues of different payload types are held behind a type-erased
//! handle. The registry is an explicit application-scoped instance, not
//! a process-wide singleton.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::backpressure::BackpressureLevel;
use crate::queue::{JobQueue, QueueMetrics, QueueState};

/// Type-erased view of a queue, enough for aggregate monitoring.
pub trait QueueHandle: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> QueueState;
    fn metrics(&self) -> QueueMetrics;
    fn backpressure_level(&self) -> BackpressureLevel;
}

impl<T: Clone + Send + 'static> QueueHandle for JobQueue<T> {
    fn name(&self) -> &str {
        JobQueue::name(self)
    }

    fn state(&self) -> QueueState {
        JobQueue::state(self)
    }

    fn metrics(&self) -> QueueMetrics {
        JobQueue::metrics(self)
    }

    fn backpressure_level(&self) -> BackpressureLevel {
        JobQueue::backpressure_level(self)
    }
}

pub struct QueueRegistry {
    queues: DashMap<String, Arc<dyn QueueHandle>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    /// Register under the queue's own name, replacing any previous
    /// registration with that name.
    pub fn register(&self, queue: Arc<dyn QueueHandle>) {
        let name = queue.name().to_string();
        if self.queues.insert(name.clone(), queue).is_some() {
            warn!(queue = %name, "replaced existing queue registration");
        } else {
            info!(queue = %name, "queue registered");
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.queues.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn QueueHandle>> {
        self.queues.get(name).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Snapshot of every registered queue, sorted by name for stable
    /// output.
    pub fn metrics(&self) -> Vec<QueueMetrics> {
        let mut all: Vec<QueueMetrics> = self
            .queues
            .iter()
            .map(|entry| entry.value().metrics())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Most severe backpressure level across all registered queues.
    pub fn system_backpressure(&self) -> BackpressureLevel {
        self.queues
            .iter()
            .map(|entry| entry.value().backpressure_level())
            .max()
            .unwrap_or(BackpressureLevel::Normal)
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}
