//! Error taxonomy shared across the dispatch core.
//!
//! Admission rejections are cheap and local: the wrapped operation is
//! never invoked. Timeouts and operation failures are observed after the
//! operation started and count against failure bookkeeping.

use std::fmt;
use std::time::Duration;

/// Why an admission check turned work away before any of it started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The circuit for the target endpoint is open.
    CircuitOpen,
    /// The queue is already at its configured maximum size.
    AtCapacity,
    /// Backpressure reached critical with reject-on-critical enabled.
    Backpressure,
    /// The queue was stopped and accepts no further work.
    Stopped,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::CircuitOpen => write!(f, "circuit open"),
            RejectReason::AtCapacity => write!(f, "at capacity"),
            RejectReason::Backpressure => write!(f, "backpressure critical"),
            RejectReason::Stopped => write!(f, "queue stopped"),
        }
    }
}

/// Outcome of a call routed through an admission guard.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// Denied before the operation was invoked. Zero cost.
    #[error("admission rejected: {0}")]
    Rejected(RejectReason),

    /// The time budget elapsed before the operation settled. The
    /// operation itself was started and is abandoned, not observed.
    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The operation itself failed.
    #[error("operation failed: {0}")]
    Failed(String),
}

impl CallError {
    /// True for rejections that never invoked the operation.
    pub fn is_rejection(&self) -> bool {
        matches!(self, CallError::Rejected(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout(_))
    }
}
