//! Registry of circuit breakers, one per provider key.
//!
//! Breakers are created lazily with a shared default config. Every
//! breaker's events are re-emitted to registry-level subscribers so an
//! observability sink can watch the whole fleet through one handle.
//!
//! The registry is an explicit instance owned by the application scope,
//! not a process-wide singleton; `destroy` tears down every breaker's
//! timer and clears subscriptions.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use sy_common::{EventHub, SubscriptionId};

use crate::breaker::{BreakerConfig, BreakerEvent, BreakerStats, CircuitBreaker, CircuitState};

/// Breakers per state, for health summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateCounts {
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

pub struct CircuitBreakerRegistry {
    default_config: Mutex<BreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    events: Arc<EventHub<BreakerEvent>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config: Mutex::new(default_config),
            breakers: DashMap::new(),
            events: Arc::new(EventHub::new()),
        }
    }

    /// Get the breaker for `provider`, creating it on first use.
    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(provider) {
            return existing.clone();
        }

        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(provider, self.default_config.lock().clone());
                let hub = self.events.clone();
                breaker.subscribe(move |event| hub.emit(event));
                info!(provider = %provider, "circuit breaker created");
                breaker
            })
            .clone()
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.breakers.contains_key(provider)
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Observe every breaker's events through one subscription.
    pub fn subscribe(&self, handler: impl Fn(&BreakerEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Subscriber panics swallowed during registry-level fan-out.
    pub fn handler_panics(&self) -> u64 {
        self.events.handler_panics()
    }

    pub fn stats(&self) -> HashMap<String, BreakerStats> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    pub fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for entry in self.breakers.iter() {
            match entry.value().state() {
                CircuitState::Closed => counts.closed += 1,
                CircuitState::Open => counts.open += 1,
                CircuitState::HalfOpen => counts.half_open += 1,
            }
        }
        counts
    }

    /// Provider keys whose breakers currently admit calls. The check is
    /// the same eager one callers use, so an expired open breaker shows
    /// up here as admitting (and flips to half-open).
    pub fn admitting(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .breakers
            .iter()
            .filter(|entry| entry.value().can_execute())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn reset_all(&self) {
        info!(breakers = self.breakers.len(), "resetting all circuit breakers");
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    /// Apply `config` to every existing breaker and to breakers created
    /// later.
    pub fn update_config(&self, config: BreakerConfig) {
        *self.default_config.lock() = config.clone();
        for entry in self.breakers.iter() {
            entry.value().update_config(config.clone());
        }
    }

    /// Tear down every breaker (aborting pending reset timers) and drop
    /// all subscriptions. The registry is empty afterwards.
    pub fn destroy(&self) {
        info!(breakers = self.breakers.len(), "destroying circuit breaker registry");
        for entry in self.breakers.iter() {
            entry.value().shutdown();
        }
        self.breakers.clear();
        self.events.clear();
    }
}

impl Drop for CircuitBreakerRegistry {
    fn drop(&mut self) {
        self.destroy();
    }
}
