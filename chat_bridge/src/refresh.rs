//! Scheduled rule refresh - background task for periodic registry
//! reloading.
//!
//! Staleness is normally detected on the request path (a cheap marker
//! probe per request), but a quiet deployment can go a long time between
//! requests. The scheduler keeps the compiled list from going stale off
//! the hot path by probing on an interval.

use intent_engine::{now_ms, RuleRegistry};
use log::info;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Configuration for the scheduled refresh task.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between refresh probes.
    pub refresh_interval: Duration,
    /// Whether the scheduler is enabled.
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(15 * 60),
            enabled: true,
        }
    }
}

/// Periodic registry refresher.
///
/// Runs as a background task spawned during service initialization.
pub struct RefreshScheduler {
    registry: Arc<RuleRegistry>,
    config: SchedulerConfig,
    /// Timestamp of the last completed refresh probe.
    last_refresh_at: Arc<RwLock<u64>>,
}

impl RefreshScheduler {
    pub fn new(registry: Arc<RuleRegistry>, config: SchedulerConfig) -> Self {
        Self {
            registry,
            config,
            last_refresh_at: Arc::new(RwLock::new(now_ms())),
        }
    }

    /// Returns the timestamp of the last completed refresh probe.
    pub fn last_refresh(&self) -> u64 {
        *self.last_refresh_at.read()
    }

    /// Starts the scheduler loop.
    ///
    /// Runs indefinitely; spawn it as a tokio task.
    pub async fn start(self: Arc<Self>) {
        if !self.config.enabled {
            info!("scheduled refresh is disabled, skipping");
            return;
        }

        info!(
            "starting scheduled refresh with {}-second interval",
            self.config.refresh_interval.as_secs()
        );

        let mut ticker = interval(self.config.refresh_interval);

        loop {
            ticker.tick().await;
            self.do_refresh();
        }
    }

    /// Executes one refresh probe. Recompilation only happens when a
    /// source reports a newer generation; otherwise this is a no-op.
    fn do_refresh(&self) {
        let rule_set = self.registry.refresh();
        info!(
            "scheduled refresh completed: {} rules at generation {}",
            rule_set.len(),
            rule_set.generation()
        );
        *self.last_refresh_at.write() = now_ms();
    }
}
