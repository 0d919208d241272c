//! Provider adapter contract.
//!
//! An adapter owns everything wire-shaped: request construction, auth,
//! response parsing, and its own retry/backoff. The orchestrator only
//! sees a stable key, a call that settles to success or typed failure,
//! and a health probe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// One logical query, fanned out to one or more providers.
#[derive(Debug, Clone)]
pub struct DispatchQuery {
    pub id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl DispatchQuery {
    pub fn new(payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Typed failure surfaced by an adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderFailure {
    /// The remote service answered with an error.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The remote service could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The remote service answered with something unusable.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// An interchangeable remote endpoint.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier; also the circuit breaker key.
    fn key(&self) -> &str;

    async fn call(&self, query: &DispatchQuery) -> Result<Value, ProviderFailure>;

    /// Liveness probe: true when the backing service looks usable.
    async fn health(&self) -> bool;
}
