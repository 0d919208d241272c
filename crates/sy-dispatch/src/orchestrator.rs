//! Provider orchestrator: one logical query, many interchangeable
//! providers.
//!
//! Fallback mode walks the provider list in priority order and stops
//! once enough providers succeeded; parallel mode invokes every
//! admitted provider concurrently and waits for all branches to settle.
//! Either way the caller gets a structured per-provider report; only
//! the all-failed case surfaces as an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use sy_breaker::{CircuitBreaker, CircuitBreakerRegistry};
use sy_common::CallError;

use crate::provider::{DispatchQuery, Provider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Sequential, priority order, stop when enough succeeded.
    Fallback,
    /// Concurrent across all admitted providers; wait for every branch.
    Parallel,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub mode: DispatchMode,
    /// Successes required before the dispatch counts as satisfied.
    pub min_successful: usize,
    /// In fallback mode, stop probing further providers once
    /// `min_successful` is reached. When false, remaining providers are
    /// still attempted for comparison data.
    pub stop_after_min_success: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Fallback,
            min_successful: 1,
            stop_after_min_success: true,
        }
    }
}

/// What one provider did with the query. Immutable once recorded.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOutcome {
    pub provider: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

/// Aggregate over every attempted provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub query_id: String,
    pub outcomes: Vec<ProviderOutcome>,
    pub successful_providers: Vec<String>,
    pub failed_providers: Vec<String>,
    pub partial_success: bool,
    pub full_success: bool,
    /// Fallback: sum of attempted latencies (sequential cost).
    /// Parallel: max of individual latencies (wall-clock cost).
    pub total_latency_ms: u64,
    /// Response of the first successful provider in priority order.
    pub primary_response: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("all providers failed for query {query_id}")]
    AllProvidersFailed {
        query_id: String,
        outcomes: Vec<ProviderOutcome>,
    },

    #[error("no providers configured")]
    NoProviders,
}

/// Dispatches queries across an ordered provider set, consulting one
/// circuit breaker per provider before each attempt.
pub struct ProviderOrchestrator {
    providers: Vec<Arc<dyn Provider>>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    config: OrchestratorConfig,
}

impl ProviderOrchestrator {
    /// Orchestrate `providers` (priority order, first is primary)
    /// without circuit breakers.
    pub fn new(providers: Vec<Arc<dyn Provider>>, config: OrchestratorConfig) -> Self {
        Self {
            providers,
            breakers: HashMap::new(),
            config,
        }
    }

    /// Same, with one breaker per provider taken from `registry`.
    pub fn with_registry(
        providers: Vec<Arc<dyn Provider>>,
        config: OrchestratorConfig,
        registry: &CircuitBreakerRegistry,
    ) -> Self {
        let breakers = providers
            .iter()
            .map(|provider| {
                let key = provider.key().to_string();
                let breaker = registry.breaker(&key);
                (key, breaker)
            })
            .collect();

        Self {
            providers,
            breakers,
            config,
        }
    }

    pub fn provider_keys(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.key().to_string()).collect()
    }

    /// Dispatch one query. Per-provider failures are folded into the
    /// report; only the all-failed case is an error.
    pub async fn dispatch(&self, query: DispatchQuery) -> Result<DispatchReport, DispatchError> {
        if self.providers.is_empty() {
            return Err(DispatchError::NoProviders);
        }

        debug!(
            query_id = %query.id,
            mode = ?self.config.mode,
            providers = self.providers.len(),
            "dispatching query"
        );

        let outcomes = match self.config.mode {
            DispatchMode::Fallback => self.dispatch_fallback(&query).await,
            DispatchMode::Parallel => self.dispatch_parallel(&query).await,
        };

        self.fold(&query, outcomes)
    }

    /// Probe every configured provider concurrently. A provider is
    /// available only if it reports healthy and its breaker admits.
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let probes = self.providers.iter().map(|provider| async move {
            let healthy = provider.health().await;
            (provider.key().to_string(), healthy)
        });

        join_all(probes)
            .await
            .into_iter()
            .map(|(key, healthy)| {
                let admitting = self
                    .breakers
                    .get(&key)
                    .map(|breaker| breaker.can_execute())
                    .unwrap_or(true);
                (key, healthy && admitting)
            })
            .collect()
    }

    /// Currently available provider keys, in priority order.
    pub async fn list_available(&self) -> Vec<String> {
        let health = self.health_check().await;
        self.providers
            .iter()
            .map(|p| p.key())
            .filter(|key| health.get(*key).copied().unwrap_or(false))
            .map(String::from)
            .collect()
    }

    async fn dispatch_fallback(&self, query: &DispatchQuery) -> Vec<ProviderOutcome> {
        let mut outcomes = Vec::with_capacity(self.providers.len());
        let mut successes = 0usize;

        for provider in &self.providers {
            let outcome = self.attempt(provider, query).await;
            if outcome.success {
                successes += 1;
            }
            outcomes.push(outcome);

            if self.config.stop_after_min_success && successes >= self.config.min_successful {
                break;
            }
        }

        outcomes
    }

    async fn dispatch_parallel(&self, query: &DispatchQuery) -> Vec<ProviderOutcome> {
        // join_all keeps input order, so outcomes stay priority-ordered
        // regardless of completion order.
        let attempts = self.providers.iter().map(|provider| self.attempt(provider, query));
        join_all(attempts).await
    }

    /// One provider attempt. When a breaker exists it applies admission
    /// control and the request timeout, and observes the outcome; a
    /// denied attempt records a zero-latency circuit-open outcome
    /// without ever invoking the adapter.
    async fn attempt(&self, provider: &Arc<dyn Provider>, query: &DispatchQuery) -> ProviderOutcome {
        let key = provider.key().to_string();

        let started = Instant::now();
        let result = match self.breakers.get(&key) {
            Some(breaker) => breaker.execute(|| provider.call(query)).await,
            None => provider
                .call(query)
                .await
                .map_err(|err| CallError::Failed(err.to_string())),
        };
        // A breaker denial never invoked the adapter; its cost is zero.
        let latency_ms = if matches!(result, Err(CallError::Rejected(_))) {
            0
        } else {
            started.elapsed().as_millis() as u64
        };

        match result {
            Ok(response) => {
                debug!(query_id = %query.id, provider = %key, latency_ms, "provider succeeded");
                ProviderOutcome {
                    provider: key,
                    success: true,
                    response: Some(response),
                    error: None,
                    latency_ms,
                }
            }
            Err(err) => {
                warn!(query_id = %query.id, provider = %key, error = %err, "provider attempt failed");
                ProviderOutcome {
                    provider: key,
                    success: false,
                    response: None,
                    error: Some(err.to_string()),
                    latency_ms,
                }
            }
        }
    }

    fn fold(
        &self,
        query: &DispatchQuery,
        outcomes: Vec<ProviderOutcome>,
    ) -> Result<DispatchReport, DispatchError> {
        let successful_providers: Vec<String> = outcomes
            .iter()
            .filter(|o| o.success)
            .map(|o| o.provider.clone())
            .collect();

        if successful_providers.is_empty() {
            warn!(query_id = %query.id, attempted = outcomes.len(), "all providers failed");
            return Err(DispatchError::AllProvidersFailed {
                query_id: query.id.clone(),
                outcomes,
            });
        }

        let failed_providers: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| o.provider.clone())
            .collect();

        // Outcomes are priority-ordered in both modes, so the first
        // success here is the primary regardless of completion order.
        let primary_response = outcomes
            .iter()
            .find(|o| o.success)
            .and_then(|o| o.response.clone());

        let total_latency_ms = match self.config.mode {
            DispatchMode::Fallback => outcomes.iter().map(|o| o.latency_ms).sum(),
            DispatchMode::Parallel => outcomes.iter().map(|o| o.latency_ms).max().unwrap_or(0),
        };

        let full_success = successful_providers.len() == self.providers.len();

        info!(
            query_id = %query.id,
            successful = successful_providers.len(),
            failed = failed_providers.len(),
            total_latency_ms,
            "dispatch complete"
        );

        Ok(DispatchReport {
            query_id: query.id.clone(),
            outcomes,
            successful_providers,
            failed_providers,
            partial_success: !full_success,
            full_success,
            total_latency_ms,
            primary_response,
        })
    }
}
