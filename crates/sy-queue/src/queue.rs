//! Managed job queue: priority-ordered, concurrency-limited,
//! backpressure-governed dispatch of a caller-supplied async processor.
//!
//! The queue owns its heap and in-flight map exclusively; an item lives
//! in at most one of them at any time. Submission is fire-and-forget:
//! `enqueue` never errors, rejection is an ordinary counted outcome, and
//! an item's fate is observed through metrics or events.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sy_common::{EventHub, RejectReason, SampleWindow, SubscriptionId};

use crate::backpressure::{BackpressureConfig, BackpressureController, BackpressureLevel};
use crate::heap::{Priority, PriorityHeap, QueueItem};

/// Most-recent processing-time samples kept for the rolling average.
const LATENCY_SAMPLE_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    /// Initial state; items accumulate but nothing dispatches.
    Paused,
    Running,
    /// No new dispatches; waiting for in-flight work to finish.
    Draining,
    /// Terminal.
    Stopped,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum queued (not in-flight) items before admission rejects.
    pub max_size: usize,
    /// Maximum concurrently processing items.
    pub max_concurrency: usize,
    /// Per-attempt budget when the enqueue does not override it.
    pub default_timeout: Duration,
    pub default_max_attempts: u32,
    /// Linear backoff base: a retry waits `retry_delay * attempts`.
    pub retry_delay: Duration,
    pub backpressure: BackpressureConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_concurrency: 10,
            default_timeout: Duration::from_secs(30),
            default_max_attempts: 3,
            retry_delay: Duration::from_millis(500),
            backpressure: BackpressureConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    pub timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub deadline: Option<Instant>,
}

impl EnqueueOptions {
    pub fn priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}

/// Why a queued item was discarded without processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The deadline had already passed when the item was popped.
    DeadlineExpired,
    /// The queue was stopped with the item still queued.
    Stopped,
}

#[derive(Debug, Clone)]
pub enum QueueEventKind {
    Completed { latency: Duration, attempts: u32 },
    Retried { attempts: u32, delay: Duration },
    /// Terminal failure; a dead-letter collaborator acts on this.
    Failed { attempts: u32, error: String },
    Dropped { reason: DropReason },
    Rejected { reason: RejectReason },
}

#[derive(Debug, Clone)]
pub struct QueueEvent {
    pub queue: String,
    /// Absent for rejections, which happen before an item exists.
    pub item_id: Option<String>,
    pub kind: QueueEventKind,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Point-in-time snapshot. Throughput is completions since the previous
/// snapshot divided by the elapsed time between them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub name: String,
    pub state: QueueState,
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub avg_processing_ms: f64,
    pub backpressure_level: BackpressureLevel,
    pub throughput_per_sec: f64,
}

type ProcessorFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type Processor<T> = Arc<dyn Fn(T) -> ProcessorFuture + Send + Sync>;

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
}

struct ThroughputState {
    last_at: Instant,
    last_completed: u64,
}

/// Priority-ordered dispatcher for one kind of job. Generic over the
/// payload; the processing function is supplied by the caller, so the
/// queue carries no business logic of its own.
pub struct JobQueue<T: Clone + Send + 'static> {
    name: String,
    config: QueueConfig,
    state: Mutex<QueueState>,
    heap: Mutex<PriorityHeap<T>>,
    in_flight: DashMap<String, Instant>,
    backpressure: BackpressureController,
    processor: RwLock<Option<Processor<T>>>,
    counters: Counters,
    samples: Mutex<SampleWindow>,
    throughput: Mutex<ThroughputState>,
    seq: AtomicU64,
    events: EventHub<QueueEvent>,
    drained: tokio::sync::Notify,
    /// Serializes dispatch cycles so the concurrency check and the
    /// in-flight insertion are atomic with respect to other cycles.
    dispatch_gate: Mutex<()>,
    weak_self: Weak<Self>,
}

impl<T: Clone + Send + 'static> JobQueue<T> {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak| Self {
            backpressure: BackpressureController::new(config.backpressure.clone()),
            name,
            config,
            state: Mutex::new(QueueState::Paused),
            heap: Mutex::new(PriorityHeap::new()),
            in_flight: DashMap::new(),
            processor: RwLock::new(None),
            counters: Counters::default(),
            samples: Mutex::new(SampleWindow::new(LATENCY_SAMPLE_CAP)),
            throughput: Mutex::new(ThroughputState {
                last_at: Instant::now(),
                last_completed: 0,
            }),
            seq: AtomicU64::new(0),
            events: EventHub::new(),
            drained: tokio::sync::Notify::new(),
            dispatch_gate: Mutex::new(()),
            weak_self: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> QueueState {
        *self.state.lock()
    }

    pub fn backpressure_level(&self) -> BackpressureLevel {
        self.backpressure.level()
    }

    /// Invoked exactly once per backpressure level transition.
    pub fn on_backpressure_change(
        &self,
        callback: impl Fn(BackpressureLevel, BackpressureLevel) + Send + Sync + 'static,
    ) {
        self.backpressure.on_level_change(callback);
    }

    /// Supply the processing function. Must be set before `start`;
    /// replacing it mid-flight affects items dispatched afterwards.
    pub fn process<F, Fut>(&self, processor: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        *self.processor.write() = Some(Arc::new(move |payload| Box::pin(processor(payload))));
    }

    pub fn subscribe(&self, handler: impl Fn(&QueueEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Submit work. Returns the item id, or `None` when admission was
    /// rejected (queue stopped, at capacity, or backpressure critical).
    /// Never errors: rejection is an ordinary outcome.
    pub fn enqueue(&self, payload: T, opts: EnqueueOptions) -> Option<String> {
        let queued = self.heap.lock().len();
        let level = self.backpressure.update(queued, self.in_flight.len());

        let reason = {
            let state = *self.state.lock();
            if state == QueueState::Stopped {
                Some(RejectReason::Stopped)
            } else if self.backpressure.should_reject() {
                Some(RejectReason::Backpressure)
            } else if queued >= self.config.max_size {
                Some(RejectReason::AtCapacity)
            } else {
                None
            }
        };

        if let Some(reason) = reason {
            self.counters.rejected.fetch_add(1, Ordering::SeqCst);
            counter!("switchyard_queue_rejected_total", "queue" => self.name.clone()).increment(1);
            debug!(queue = %self.name, %reason, level = ?level, "enqueue rejected");
            self.emit(None, QueueEventKind::Rejected { reason });
            return None;
        }

        let item = QueueItem {
            id: Uuid::new_v4().to_string(),
            payload,
            priority: opts.priority,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: opts.max_attempts.unwrap_or(self.config.default_max_attempts),
            timeout: opts.timeout.unwrap_or(self.config.default_timeout),
            deadline: opts.deadline,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        };
        let id = item.id.clone();

        self.heap.lock().push(item);
        debug!(queue = %self.name, item_id = %id, priority = ?opts.priority, "item enqueued");

        if self.state() == QueueState::Running {
            self.pump();
        }
        Some(id)
    }

    /// Begin dispatching. Only a paused queue can start; draining and
    /// stopped queues are past restarting.
    pub fn start(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                QueueState::Paused => *state = QueueState::Running,
                QueueState::Running => return,
                QueueState::Draining | QueueState::Stopped => {
                    warn!(queue = %self.name, state = ?*state, "cannot start queue");
                    return;
                }
            }
        }
        info!(queue = %self.name, "queue started");
        self.pump();
    }

    /// Stop starting new items; queued items keep accumulating.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if *state == QueueState::Running {
            *state = QueueState::Paused;
            info!(queue = %self.name, "queue paused");
        }
    }

    /// Stop starting new items, wait for every in-flight item to
    /// settle, then stop. Queued items are left undispatched.
    pub async fn drain(&self) {
        {
            let mut state = self.state.lock();
            if *state == QueueState::Stopped {
                return;
            }
            *state = QueueState::Draining;
        }
        info!(queue = %self.name, in_flight = self.in_flight.len(), "queue draining");

        loop {
            if self.in_flight.is_empty() {
                break;
            }
            let notified = self.drained.notified();
            if self.in_flight.is_empty() {
                break;
            }
            notified.await;
        }

        *self.state.lock() = QueueState::Stopped;
        info!(queue = %self.name, "queue drained and stopped");
    }

    /// Stop immediately, discarding every still-queued item with a
    /// dropped notification. In-flight items run to completion; there
    /// is no cancellation.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == QueueState::Stopped {
                return;
            }
            *state = QueueState::Stopped;
        }

        let discarded = self.heap.lock().drain();
        for item in &discarded {
            self.counters.dropped.fetch_add(1, Ordering::SeqCst);
            self.emit(
                Some(item.id.clone()),
                QueueEventKind::Dropped {
                    reason: DropReason::Stopped,
                },
            );
        }

        info!(
            queue = %self.name,
            discarded = discarded.len(),
            in_flight = self.in_flight.len(),
            "queue stopped"
        );
    }

    pub fn queued_len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn metrics(&self) -> QueueMetrics {
        let completed = self.counters.completed.load(Ordering::SeqCst);

        let throughput_per_sec = {
            let mut throughput = self.throughput.lock();
            let elapsed = throughput.last_at.elapsed().as_secs_f64();
            let delta = completed.saturating_sub(throughput.last_completed);
            throughput.last_at = Instant::now();
            throughput.last_completed = completed;
            if elapsed > 0.0 {
                delta as f64 / elapsed
            } else {
                0.0
            }
        };

        QueueMetrics {
            name: self.name.clone(),
            state: self.state(),
            queued: self.heap.lock().len(),
            in_flight: self.in_flight.len(),
            completed,
            failed: self.counters.failed.load(Ordering::SeqCst),
            retried: self.counters.retried.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
            dropped: self.counters.dropped.load(Ordering::SeqCst),
            avg_processing_ms: self.samples.lock().average(),
            backpressure_level: self.backpressure.level(),
            throughput_per_sec,
        }
    }

    /// Dispatch cycle: start queued items while the queue is running,
    /// backpressure is not pausing, and the concurrency budget allows.
    /// Re-entered after every enqueue, completion, and retry re-push.
    fn pump(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(queue = %self.name, "no runtime, dispatch deferred to next async entry");
            return;
        };

        let _gate = this.dispatch_gate.lock();
        loop {
            if this.state() != QueueState::Running {
                break;
            }

            let queued = this.heap.lock().len();
            this.backpressure.update(queued, this.in_flight.len());
            if this.backpressure.should_pause() {
                debug!(queue = %this.name, "dispatch paused by backpressure");
                break;
            }
            if this.in_flight.len() >= this.config.max_concurrency {
                break;
            }

            let Some(item) = this.heap.lock().pop() else {
                break;
            };

            // Deadline is enforced at the admission-to-dispatch
            // boundary only; an already-started item cannot be
            // interrupted by it.
            if let Some(deadline) = item.deadline {
                if Instant::now() >= deadline {
                    this.counters.dropped.fetch_add(1, Ordering::SeqCst);
                    debug!(queue = %this.name, item_id = %item.id, "deadline expired, dropping");
                    this.emit(
                        Some(item.id.clone()),
                        QueueEventKind::Dropped {
                            reason: DropReason::DeadlineExpired,
                        },
                    );
                    continue;
                }
            }

            let Some(processor) = this.processor.read().clone() else {
                // Nothing to run items with; put it back and wait for
                // `process` to be called.
                warn!(queue = %this.name, "no processor registered, item stays queued");
                this.heap.lock().push(item);
                break;
            };

            this.in_flight.insert(item.id.clone(), Instant::now());
            let task_queue = this.clone();
            handle.spawn(async move {
                task_queue.run_item(processor, item).await;
            });
        }
    }

    async fn run_item(self: Arc<Self>, processor: Processor<T>, mut item: QueueItem<T>) {
        item.attempts += 1;
        let started = Instant::now();

        let outcome = match tokio::time::timeout(item.timeout, processor(item.payload.clone())).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(format!("timed out after {}ms", item.timeout.as_millis())),
        };
        let latency = started.elapsed();

        self.in_flight.remove(&item.id);

        match outcome {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::SeqCst);
                self.samples.lock().record(latency.as_millis() as u64);
                counter!("switchyard_queue_completed_total", "queue" => self.name.clone())
                    .increment(1);
                debug!(
                    queue = %self.name,
                    item_id = %item.id,
                    latency_ms = latency.as_millis() as u64,
                    attempts = item.attempts,
                    "item completed"
                );
                self.emit(
                    Some(item.id.clone()),
                    QueueEventKind::Completed {
                        latency,
                        attempts: item.attempts,
                    },
                );
            }
            Err(error) if item.attempts < item.max_attempts => {
                self.counters.retried.fetch_add(1, Ordering::SeqCst);
                let delay = self.config.retry_delay * item.attempts;
                warn!(
                    queue = %self.name,
                    item_id = %item.id,
                    attempt = item.attempts,
                    max_attempts = item.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "item failed, scheduling retry"
                );
                self.emit(
                    Some(item.id.clone()),
                    QueueEventKind::Retried {
                        attempts: item.attempts,
                        delay,
                    },
                );

                let this = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if this.state() == QueueState::Stopped {
                        this.counters.dropped.fetch_add(1, Ordering::SeqCst);
                        this.emit(
                            Some(item.id.clone()),
                            QueueEventKind::Dropped {
                                reason: DropReason::Stopped,
                            },
                        );
                        return;
                    }
                    this.heap.lock().push(item);
                    if this.state() == QueueState::Running {
                        this.pump();
                    }
                });
            }
            Err(error) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                counter!("switchyard_queue_failed_total", "queue" => self.name.clone())
                    .increment(1);
                warn!(
                    queue = %self.name,
                    item_id = %item.id,
                    attempts = item.attempts,
                    error = %error,
                    "item failed terminally"
                );
                self.emit(
                    Some(item.id.clone()),
                    QueueEventKind::Failed {
                        attempts: item.attempts,
                        error,
                    },
                );
            }
        }

        self.pump();
        self.drained.notify_waiters();
    }

    fn emit(&self, item_id: Option<String>, kind: QueueEventKind) {
        self.events.emit(&QueueEvent {
            queue: self.name.clone(),
            item_id,
            kind,
            timestamp: Utc::now(),
        });
    }
}
