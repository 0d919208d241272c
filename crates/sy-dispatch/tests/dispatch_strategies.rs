//! Fallback and parallel dispatch strategies against scripted providers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use sy_breaker::{BreakerConfig, CircuitBreakerRegistry, CircuitState};
use sy_dispatch::{
    DispatchError, DispatchMode, DispatchQuery, OrchestratorConfig, Provider, ProviderFailure,
    ProviderOrchestrator,
};

/// Scripted endpoint: waits `latency`, then succeeds or fails.
struct FakeProvider {
    key: String,
    latency: Duration,
    fail: bool,
    healthy: bool,
    calls: AtomicUsize,
}

impl FakeProvider {
    fn ok(key: &str, latency_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            latency: Duration::from_millis(latency_ms),
            fail: false,
            healthy: true,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(key: &str, latency_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            latency: Duration::from_millis(latency_ms),
            fail: true,
            healthy: true,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn key(&self) -> &str {
        &self.key
    }

    async fn call(&self, _query: &DispatchQuery) -> Result<Value, ProviderFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        if self.fail {
            Err(ProviderFailure::Upstream("scripted failure".to_string()))
        } else {
            Ok(json!({ "from": self.key }))
        }
    }

    async fn health(&self) -> bool {
        self.healthy
    }
}

fn providers(list: Vec<Arc<FakeProvider>>) -> Vec<Arc<dyn Provider>> {
    list.into_iter().map(|p| p as Arc<dyn Provider>).collect()
}

fn fallback_config() -> OrchestratorConfig {
    OrchestratorConfig {
        mode: DispatchMode::Fallback,
        min_successful: 1,
        stop_after_min_success: true,
    }
}

#[tokio::test]
async fn fallback_skips_to_next_provider_on_failure() {
    let a = FakeProvider::failing("a", 5);
    let b = FakeProvider::ok("b", 5);
    let orchestrator = ProviderOrchestrator::new(providers(vec![a.clone(), b.clone()]), fallback_config());

    let report = orchestrator
        .dispatch(DispatchQuery::new(json!({ "q": 1 })))
        .await
        .expect("one provider succeeded");

    assert_eq!(report.successful_providers, vec!["b".to_string()]);
    assert_eq!(report.failed_providers, vec!["a".to_string()]);
    assert_eq!(report.primary_response, Some(json!({ "from": "b" })));
    assert!(report.partial_success);
    assert!(!report.full_success);
}

#[tokio::test]
async fn fallback_stops_after_min_success() {
    let a = FakeProvider::ok("a", 5);
    let b = FakeProvider::ok("b", 5);
    let orchestrator = ProviderOrchestrator::new(providers(vec![a.clone(), b.clone()]), fallback_config());

    let report = orchestrator
        .dispatch(DispatchQuery::new(json!({ "q": 1 })))
        .await
        .unwrap();

    assert_eq!(report.primary_response, Some(json!({ "from": "a" })));
    assert!(report.full_success);
    assert_eq!(b.calls(), 0);
}

#[tokio::test]
async fn fallback_keeps_probing_when_configured() {
    let a = FakeProvider::ok("a", 5);
    let b = FakeProvider::ok("b", 5);
    let config = OrchestratorConfig {
        stop_after_min_success: false,
        ..fallback_config()
    };
    let orchestrator = ProviderOrchestrator::new(providers(vec![a.clone(), b.clone()]), config);

    let report = orchestrator
        .dispatch(DispatchQuery::new(json!({ "q": 1 })))
        .await
        .unwrap();

    assert_eq!(b.calls(), 1);
    assert_eq!(report.successful_providers.len(), 2);
    // Primary stays the first success in priority order.
    assert_eq!(report.primary_response, Some(json!({ "from": "a" })));
}

#[tokio::test]
async fn parallel_latency_is_max_fallback_is_sum() {
    let query = json!({ "q": 1 });

    // Parallel over 50ms + 300ms providers: wall clock tracks the
    // slowest branch, not the sum.
    let parallel = ProviderOrchestrator::new(
        providers(vec![FakeProvider::ok("fast", 50), FakeProvider::ok("slow", 300)]),
        OrchestratorConfig {
            mode: DispatchMode::Parallel,
            ..fallback_config()
        },
    );
    let report = parallel.dispatch(DispatchQuery::new(query.clone())).await.unwrap();
    assert!(
        (300..400).contains(&report.total_latency_ms),
        "parallel latency should be ~max, got {}",
        report.total_latency_ms
    );
    // Priority order wins over completion order.
    assert_eq!(report.primary_response, Some(json!({ "from": "fast" })));

    // Fallback over the same pair (first fails so both are attempted):
    // sequential cost model, latencies add up.
    let fallback = ProviderOrchestrator::new(
        providers(vec![FakeProvider::failing("fast", 50), FakeProvider::ok("slow", 300)]),
        fallback_config(),
    );
    let report = fallback.dispatch(DispatchQuery::new(query)).await.unwrap();
    assert!(
        report.total_latency_ms >= 350 && report.total_latency_ms < 600,
        "fallback latency should be ~sum, got {}",
        report.total_latency_ms
    );
}

#[tokio::test]
async fn parallel_primary_is_priority_ordered_among_successes() {
    let a = FakeProvider::failing("a", 5);
    let b = FakeProvider::ok("b", 200);
    let c = FakeProvider::ok("c", 5);
    let orchestrator = ProviderOrchestrator::new(
        providers(vec![a, b, c]),
        OrchestratorConfig {
            mode: DispatchMode::Parallel,
            ..fallback_config()
        },
    );

    let report = orchestrator
        .dispatch(DispatchQuery::new(json!({ "q": 1 })))
        .await
        .unwrap();

    // c finished long before b, but b outranks it.
    assert_eq!(report.primary_response, Some(json!({ "from": "b" })));
    assert_eq!(report.successful_providers, vec!["b".to_string(), "c".to_string()]);
}

#[tokio::test]
async fn open_breaker_short_circuits_without_invoking_adapter() {
    let registry = CircuitBreakerRegistry::new(BreakerConfig::default());
    let a = FakeProvider::ok("a", 5);
    let b = FakeProvider::ok("b", 5);
    let orchestrator = ProviderOrchestrator::with_registry(
        providers(vec![a.clone(), b.clone()]),
        fallback_config(),
        &registry,
    );

    registry.breaker("a").force_state(CircuitState::Open);

    let report = orchestrator
        .dispatch(DispatchQuery::new(json!({ "q": 1 })))
        .await
        .unwrap();

    assert_eq!(a.calls(), 0);
    assert_eq!(report.failed_providers, vec!["a".to_string()]);
    assert_eq!(report.primary_response, Some(json!({ "from": "b" })));

    let denied = &report.outcomes[0];
    assert_eq!(denied.latency_ms, 0);
    assert!(denied.error.as_deref().unwrap_or("").contains("circuit open"));
}

#[tokio::test]
async fn all_failed_surfaces_aggregate_error() {
    let orchestrator = ProviderOrchestrator::new(
        providers(vec![FakeProvider::failing("a", 5), FakeProvider::failing("b", 5)]),
        fallback_config(),
    );

    let err = orchestrator
        .dispatch(DispatchQuery::new(json!({ "q": 1 })))
        .await
        .expect_err("every provider failed");

    match err {
        DispatchError::AllProvidersFailed { outcomes, .. } => {
            assert_eq!(outcomes.len(), 2);
            assert!(outcomes.iter().all(|o| !o.success));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn availability_requires_health_and_admission() {
    let registry = CircuitBreakerRegistry::new(BreakerConfig::default());
    let a = FakeProvider::ok("a", 5);
    let b = FakeProvider::ok("b", 5);
    let unhealthy = Arc::new(FakeProvider {
        key: "c".to_string(),
        latency: Duration::from_millis(5),
        fail: false,
        healthy: false,
        calls: AtomicUsize::new(0),
    });

    let orchestrator = ProviderOrchestrator::with_registry(
        providers(vec![a, b, unhealthy]),
        fallback_config(),
        &registry,
    );
    registry.breaker("b").force_state(CircuitState::Open);

    let health = orchestrator.health_check().await;
    assert_eq!(health["a"], true);
    assert_eq!(health["b"], false, "healthy but breaker denies");
    assert_eq!(health["c"], false, "breaker admits but probe is unhealthy");

    assert_eq!(orchestrator.list_available().await, vec!["a".to_string()]);
}
