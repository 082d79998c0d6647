//! Process-wide switch that retires the primary transport
//!
//! After `threshold` non-cancellation failures of the primary transport every
//! new request starts on the fallback. The switch is one-way: once tripped it
//! stays tripped for the lifetime of the breaker.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::info;

/// One-way failure counter shared by every queue in a process
///
/// Share it as `Arc<CircuitBreaker>`.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    failures: AtomicU32,
    tripped: AtomicBool,
}

impl CircuitBreaker {
    /// Create a breaker that trips after `threshold` failures
    ///
    /// A threshold of zero trips immediately.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            failures: AtomicU32::new(0),
            tripped: AtomicBool::new(threshold == 0),
        }
    }

    /// Record one failed primary attempt.
    ///
    /// Returns `true` if this failure tripped the breaker.
    pub fn record_failure(&self) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        if failures < self.threshold {
            return false;
        }

        let tripped_now = !self.tripped.swap(true, Ordering::AcqRel);
        if tripped_now {
            info!(failures, "primary transport disabled, switching to fallback");
        }
        tripped_now
    }

    /// Whether new requests must skip the primary transport
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Failures recorded so far
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Configured threshold
    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_FAILURE_THRESHOLD)
    }
}
