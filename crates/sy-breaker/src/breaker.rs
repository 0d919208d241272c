//! Circuit breaker for one remote endpoint.
//!
//! # States
//! - Closed: calls pass through; failures are tracked in a sliding window
//! - Open: calls fail fast until the reset timeout elapses
//! - HalfOpen: trial calls probe whether the endpoint recovered
//!
//! # State transitions
//! ```text
//! Closed   -> Open:     window failure count reaches failure_threshold
//! Open     -> HalfOpen: reset_timeout elapsed since entering Open
//! HalfOpen -> Closed:   success_threshold consecutive successes
//! HalfOpen -> Open:     any single failure
//! ```
//!
//! Open -> HalfOpen has two triggers that must agree: a scheduled timer
//! and an eager recheck on every admission call. Both funnel into the
//! same elapsed-time computation on the monotonic clock, so the
//! transition is idempotent regardless of which path fires first. The
//! timer is an accelerator; the admission check is authoritative.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sy_common::{CallError, EventHub, RejectReason, SubscriptionId, TimestampWindow};

/// Upper bound on tracked failure timestamps; a storm beyond this only
/// evicts the oldest entries, which the threshold check never needs.
const FAILURE_WINDOW_CAP: usize = 128;

/// Admission state of a single breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the monitoring window that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// Time spent open before a recovery probe is admitted.
    pub reset_timeout: Duration,
    /// Per-call time budget raced against the wrapped operation.
    pub request_timeout: Duration,
    /// Sliding window over which failures are counted.
    pub monitoring_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            monitoring_window: Duration::from_secs(60),
        }
    }
}

/// What a breaker observed, for subscribers.
#[derive(Debug, Clone)]
pub enum BreakerEventKind {
    StateChange { from: CircuitState },
    Success { latency: Duration },
    Failure { latency: Duration, timed_out: bool, error: String },
    Rejected,
}

#[derive(Debug, Clone)]
pub struct BreakerEvent {
    pub provider: String,
    pub kind: BreakerEventKind,
    /// State after the event was applied.
    pub state: CircuitState,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time counters for dashboards and tests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub provider: String,
    pub state: CircuitState,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    /// Failures still inside the monitoring window.
    pub recent_failures: usize,
    pub millis_in_state: u64,
}

struct BreakerInner {
    state: CircuitState,
    config: BreakerConfig,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    consecutive_successes: u32,
    consecutive_failures: u32,
    failure_times: TimestampWindow,
    last_transition: Instant,
    reset_timer: Option<JoinHandle<()>>,
}

/// Per-endpoint failure detector. Exclusively owns its counters; other
/// components interact only through `execute`, `can_execute` and the
/// administrative surface (`force_state`, `reset`, `update_config`).
pub struct CircuitBreaker {
    provider: String,
    inner: Mutex<BreakerInner>,
    events: EventHub<BreakerEvent>,
    weak_self: Weak<CircuitBreaker>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Arc<Self> {
        let provider = provider.into();
        Arc::new_cyclic(|weak| Self {
            provider,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_times: TimestampWindow::new(config.monitoring_window, FAILURE_WINDOW_CAP),
                config,
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
                consecutive_successes: 0,
                consecutive_failures: 0,
                last_transition: Instant::now(),
                reset_timer: None,
            }),
            events: EventHub::new(),
            weak_self: weak.clone(),
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call would currently be admitted. While open, this is
    /// the eager half of the dual recovery trigger: an expired open
    /// breaker flips to half-open here.
    pub fn can_execute(&self) -> bool {
        let (admitted, event) = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => (true, None),
                CircuitState::Open => {
                    if inner.last_transition.elapsed() >= inner.config.reset_timeout {
                        let event = self.transition(&mut inner, CircuitState::HalfOpen);
                        (true, Some(event))
                    } else {
                        (false, None)
                    }
                }
            }
        };

        if let Some(event) = event {
            self.events.emit(&event);
        }
        admitted
    }

    /// Run `operation` under this breaker's admission control and
    /// request timeout. A denied call costs nothing and the operation is
    /// never invoked.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if !self.can_execute() {
            self.on_rejected();
            return Err(CallError::Rejected(RejectReason::CircuitOpen));
        }

        let request_timeout = self.inner.lock().config.request_timeout;
        let started = Instant::now();

        match tokio::time::timeout(request_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.on_success(started.elapsed());
                Ok(value)
            }
            Ok(Err(err)) => {
                let message = err.to_string();
                self.on_failure(started.elapsed(), false, message.clone());
                Err(CallError::Failed(message))
            }
            Err(_) => {
                let error = CallError::Timeout(request_timeout);
                self.on_failure(started.elapsed(), true, error.to_string());
                Err(error)
            }
        }
    }

    /// Administrative escape hatch: jump straight to `state`. Entering
    /// closed clears all failure bookkeeping; entering open schedules
    /// the usual reset timer so the breaker still recovers on its own.
    pub fn force_state(&self, state: CircuitState) {
        let event = {
            let mut inner = self.inner.lock();
            if inner.state == state {
                None
            } else {
                warn!(provider = %self.provider, state = ?state, "circuit state forced");
                Some(self.transition(&mut inner, state))
            }
        };

        if let Some(event) = event {
            self.events.emit(&event);
        }
    }

    /// Clear every counter and return to closed.
    pub fn reset(&self) {
        let event = {
            let mut inner = self.inner.lock();
            inner.total_successes = 0;
            inner.total_failures = 0;
            inner.total_rejections = 0;

            if inner.state != CircuitState::Closed {
                Some(self.transition(&mut inner, CircuitState::Closed))
            } else {
                inner.failure_times.clear();
                inner.consecutive_successes = 0;
                inner.consecutive_failures = 0;
                None
            }
        };

        info!(provider = %self.provider, "circuit breaker reset");
        if let Some(event) = event {
            self.events.emit(&event);
        }
    }

    /// Takes effect for subsequent calls; the current state is kept.
    pub fn update_config(&self, config: BreakerConfig) {
        let mut inner = self.inner.lock();
        inner.failure_times.set_window(config.monitoring_window);
        inner.config = config;
    }

    pub fn subscribe(&self, handler: impl Fn(&BreakerEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock();
        let recent_failures = inner.failure_times.count(Instant::now());
        BreakerStats {
            provider: self.provider.clone(),
            state: inner.state,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            consecutive_successes: inner.consecutive_successes,
            consecutive_failures: inner.consecutive_failures,
            recent_failures,
            millis_in_state: inner.last_transition.elapsed().as_millis() as u64,
        }
    }

    /// Abort the pending reset timer and drop all subscriptions. Called
    /// by the registry on teardown; the breaker is inert afterwards.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if let Some(timer) = inner.reset_timer.take() {
            timer.abort();
        }
        self.events.clear();
    }

    fn on_success(&self, latency: Duration) {
        let mut pending = Vec::with_capacity(2);
        {
            let mut inner = self.inner.lock();
            inner.total_successes += 1;
            inner.consecutive_successes += 1;
            inner.consecutive_failures = 0;

            pending.push(self.event(BreakerEventKind::Success { latency }, inner.state));

            if inner.state == CircuitState::HalfOpen
                && inner.consecutive_successes >= inner.config.success_threshold
            {
                pending.push(self.transition(&mut inner, CircuitState::Closed));
            }
        }

        for event in &pending {
            self.events.emit(event);
        }
    }

    fn on_failure(&self, latency: Duration, timed_out: bool, error: String) {
        let mut pending = Vec::with_capacity(2);
        {
            let mut inner = self.inner.lock();
            inner.total_failures += 1;
            inner.consecutive_failures += 1;
            inner.consecutive_successes = 0;

            let now = Instant::now();
            inner.failure_times.record(now);

            pending.push(self.event(
                BreakerEventKind::Failure {
                    latency,
                    timed_out,
                    error,
                },
                inner.state,
            ));

            match inner.state {
                CircuitState::Closed => {
                    let recent = inner.failure_times.count(now);
                    if recent >= inner.config.failure_threshold as usize {
                        pending.push(self.transition(&mut inner, CircuitState::Open));
                    }
                }
                // No tolerance while probing: one failure reopens.
                CircuitState::HalfOpen => {
                    pending.push(self.transition(&mut inner, CircuitState::Open));
                }
                CircuitState::Open => {}
            }
        }

        for event in &pending {
            self.events.emit(event);
        }
    }

    fn on_rejected(&self) {
        let event = {
            let mut inner = self.inner.lock();
            inner.total_rejections += 1;
            self.event(BreakerEventKind::Rejected, inner.state)
        };
        counter!("switchyard_breaker_rejections_total", "provider" => self.provider.clone())
            .increment(1);
        self.events.emit(&event);
    }

    /// Apply a state change under the lock. The caller emits the
    /// returned event after releasing it.
    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) -> BreakerEvent {
        let from = inner.state;
        inner.state = to;
        inner.last_transition = Instant::now();

        if let Some(timer) = inner.reset_timer.take() {
            timer.abort();
        }

        match to {
            CircuitState::Closed => {
                inner.failure_times.clear();
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
            }
            CircuitState::Open => {
                inner.reset_timer = self.spawn_reset_timer(inner.config.reset_timeout);
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
            }
        }

        info!(
            provider = %self.provider,
            from = ?from,
            to = ?to,
            "circuit state change"
        );
        counter!(
            "switchyard_breaker_transitions_total",
            "provider" => self.provider.clone()
        )
        .increment(1);

        self.event(BreakerEventKind::StateChange { from }, to)
    }

    /// Timer half of the dual recovery trigger. Best-effort: outside a
    /// tokio runtime no timer is scheduled and the eager check in
    /// `can_execute` carries recovery alone.
    fn spawn_reset_timer(&self, after: Duration) -> Option<JoinHandle<()>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(provider = %self.provider, "no runtime, relying on eager recovery check");
            return None;
        };

        let weak = self.weak_self.clone();
        Some(handle.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(breaker) = weak.upgrade() {
                breaker.try_half_open();
            }
        }))
    }

    fn try_half_open(&self) {
        let event = {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::Open
                && inner.last_transition.elapsed() >= inner.config.reset_timeout
            {
                Some(self.transition(&mut inner, CircuitState::HalfOpen))
            } else {
                None
            }
        };

        if let Some(event) = event {
            self.events.emit(&event);
        }
    }

    fn event(&self, kind: BreakerEventKind, state: CircuitState) -> BreakerEvent {
        BreakerEvent {
            provider: self.provider.clone(),
            kind,
            state,
            timestamp: Utc::now(),
        }
    }
}
