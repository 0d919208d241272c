//! Priority-ordered, backpressure-governed job dispatch for the
//! Switchyard core.
//!
//! - PriorityHeap: array-backed max-heap ordering queued items
//! - BackpressureController: discrete load classifier over watermarks
//! - JobQueue: concurrency-limited dispatcher driving a caller-supplied
//!   async processor with timeouts, linear-backoff retries, and metrics
//! - QueueRegistry: named queues with an aggregate, system-wide view

pub mod backpressure;
pub mod heap;
pub mod queue;
pub mod registry;

pub use backpressure::{BackpressureConfig, BackpressureController, BackpressureLevel};
pub use heap::{Priority, PriorityHeap, QueueItem};
pub use queue::{
    DropReason, EnqueueOptions, JobQueue, QueueConfig, QueueEvent, QueueEventKind, QueueMetrics,
    QueueState,
};
pub use registry::{QueueHandle, QueueRegistry};
