//! Multi-provider dispatch for the Switchyard core.
//!
//! - Provider: the adapter contract for one interchangeable remote
//!   endpoint (call + health probe); wire format is the adapter's business
//! - ProviderOrchestrator: fans one logical query out to an ordered
//!   provider set with fallback or parallel strategies, consulting one
//!   circuit breaker per provider, and folds the attempts into a
//!   structured multi-outcome report

pub mod orchestrator;
pub mod provider;

pub use orchestrator::{
    DispatchError, DispatchMode, DispatchReport, OrchestratorConfig, ProviderOrchestrator,
    ProviderOutcome,
};
pub use provider::{DispatchQuery, Provider, ProviderFailure};
