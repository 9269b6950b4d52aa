//! # Dispatch Telemetry
//!
//! Lock-free counters over the request path. Counting only; per-rule hit
//! bookkeeping lives on the rules themselves and in the store.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Service-level counters, incremented with relaxed atomics on the hot
/// path.
#[derive(Debug, Default)]
pub struct DispatchTelemetry {
    /// Requests that passed validation.
    requests: AtomicU64,
    /// Requests where a rule matched.
    matched: AtomicU64,
    /// Requests answered with the generic fallback (no match, or a
    /// matched action that produced nothing).
    fallbacks: AtomicU64,
    /// Matched requests whose action failed and degraded to the fallback.
    degraded: AtomicU64,
}

impl DispatchTelemetry {
    pub fn new() -> Self {
        DispatchTelemetry::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_match(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time copy of all counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }
}

/// Counter values at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub requests: u64,
    pub matched: u64,
    pub fallbacks: u64,
    pub degraded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let telemetry = DispatchTelemetry::new();
        telemetry.record_request();
        telemetry.record_request();
        telemetry.record_match();
        telemetry.record_fallback();

        let snap = telemetry.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.matched, 1);
        assert_eq!(snap.fallbacks, 1);
        assert_eq!(snap.degraded, 0);
    }
}
