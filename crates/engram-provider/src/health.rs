//! Provider health tracking — real request outcomes plus independent
//! liveness probes on a timer.
//!
//! A provider flips unhealthy after `failure_threshold` consecutive failures
//! and recovers after `success_threshold` consecutive successes. A bounded
//! ring of check events is retained for diagnostics.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use engram_core::config::HealthConfig;

use crate::provider::LlmProvider;

/// One recorded health observation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckEvent {
    /// Unix timestamp (seconds).
    pub timestamp: i64,
    pub healthy: bool,
    pub latency_ms: u64,
    /// "request" for caller-recorded outcomes, "probe" for the timer.
    pub source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct ProviderHealth {
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_requests: u64,
    failed_requests: u64,
    total_latency_ms: u64,
    latency_samples: u64,
    last_error: Option<String>,
    is_healthy: bool,
    checks: VecDeque<CheckEvent>,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_requests: 0,
            failed_requests: 0,
            total_latency_ms: 0,
            latency_samples: 0,
            last_error: None,
            is_healthy: true,
            checks: VecDeque::new(),
        }
    }

    fn push_check(&mut self, event: CheckEvent, cap: usize) {
        if self.checks.len() >= cap {
            self.checks.pop_front();
        }
        self.checks.push_back(event);
    }
}

/// Public snapshot of one provider's health state.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub name: String,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: u64,
    pub last_error: Option<String>,
    pub recent_checks: Vec<CheckEvent>,
}

/// Concurrent health tracker for all provider transports.
pub struct HealthMonitor {
    entries: DashMap<String, ProviderHealth>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            config,
        })
    }

    /// Record a successful request with its latency.
    pub fn record_success(&self, provider: &str, latency_ms: u64) {
        let mut entry = self
            .entries
            .entry(provider.to_string())
            .or_insert_with(ProviderHealth::new);
        entry.total_requests += 1;
        entry.total_latency_ms += latency_ms;
        entry.latency_samples += 1;
        self.apply_outcome(&mut entry, true, latency_ms, "request", None);
    }

    /// Record a failed request.
    pub fn record_failure(&self, provider: &str, error: &str) {
        let mut entry = self
            .entries
            .entry(provider.to_string())
            .or_insert_with(ProviderHealth::new);
        entry.total_requests += 1;
        entry.failed_requests += 1;
        entry.last_error = Some(error.to_string());
        self.apply_outcome(&mut entry, false, 0, "request", Some(error.to_string()));
    }

    /// Record the outcome of an independent liveness probe. Probes feed the
    /// consecutive counters but not the request totals.
    pub fn record_probe(&self, provider: &str, healthy: bool, latency_ms: u64) {
        let mut entry = self
            .entries
            .entry(provider.to_string())
            .or_insert_with(ProviderHealth::new);
        let error = (!healthy).then(|| "liveness probe failed".to_string());
        if let Some(ref e) = error {
            entry.last_error = Some(e.clone());
        }
        self.apply_outcome(&mut entry, healthy, latency_ms, "probe", error);
    }

    fn apply_outcome(
        &self,
        entry: &mut ProviderHealth,
        healthy: bool,
        latency_ms: u64,
        source: &'static str,
        error: Option<String>,
    ) {
        if healthy {
            entry.consecutive_successes += 1;
            entry.consecutive_failures = 0;
            if !entry.is_healthy && entry.consecutive_successes >= self.config.success_threshold {
                entry.is_healthy = true;
            }
        } else {
            entry.consecutive_failures += 1;
            entry.consecutive_successes = 0;
            if entry.is_healthy && entry.consecutive_failures >= self.config.failure_threshold {
                entry.is_healthy = false;
            }
        }
        entry.push_check(
            CheckEvent {
                timestamp: chrono::Utc::now().timestamp(),
                healthy,
                latency_ms,
                source,
                error,
            },
            self.config.history_size,
        );
    }

    /// Current health verdict. Providers with no recorded traffic are healthy.
    pub fn is_healthy(&self, provider: &str) -> bool {
        self.entries
            .get(provider)
            .map(|e| e.is_healthy)
            .unwrap_or(true)
    }

    pub fn snapshot(&self, provider: &str) -> Option<HealthSnapshot> {
        self.entries.get(provider).map(|e| HealthSnapshot {
            name: provider.to_string(),
            is_healthy: e.is_healthy,
            consecutive_failures: e.consecutive_failures,
            consecutive_successes: e.consecutive_successes,
            total_requests: e.total_requests,
            failed_requests: e.failed_requests,
            average_response_time_ms: if e.latency_samples > 0 {
                e.total_latency_ms / e.latency_samples
            } else {
                0
            },
            last_error: e.last_error.clone(),
            recent_checks: e.checks.iter().cloned().collect(),
        })
    }

    pub fn all_snapshots(&self) -> Vec<HealthSnapshot> {
        self.entries
            .iter()
            .filter_map(|e| self.snapshot(e.key()))
            .collect()
    }

    /// Spawn the periodic probe loop for one transport. The loop exits when
    /// `shutdown` broadcasts `true`.
    pub fn spawn_probe_loop(
        self: &Arc<Self>,
        provider: Arc<dyn LlmProvider>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        let interval = Duration::from_secs(monitor.config.probe_interval_secs);
        let probe_timeout = Duration::from_secs(monitor.config.probe_timeout_secs);
        tokio::spawn(async move {
            info!(provider = provider.name(), "health probe loop started");
            let mut ticker = tokio::time::interval(interval);
            // Consume the immediate first tick so the first real probe waits
            // a full interval after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        let healthy = tokio::time::timeout(probe_timeout, provider.probe())
                            .await
                            .unwrap_or(false);
                        let latency = started.elapsed().as_millis() as u64;
                        if healthy {
                            debug!(provider = provider.name(), latency, "liveness probe ok");
                        } else {
                            warn!(provider = provider.name(), "liveness probe failed");
                        }
                        monitor.record_probe(provider.name(), healthy, latency);
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!(provider = provider.name(), "health probe loop stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> Arc<HealthMonitor> {
        HealthMonitor::new(HealthConfig::default())
    }

    #[test]
    fn unknown_provider_is_healthy() {
        assert!(monitor().is_healthy("never-seen"));
    }

    #[test]
    fn flips_unhealthy_at_failure_threshold() {
        let m = monitor();
        m.record_failure("p", "boom");
        m.record_failure("p", "boom");
        assert!(m.is_healthy("p"));
        m.record_failure("p", "boom");
        assert!(!m.is_healthy("p"));
    }

    #[test]
    fn recovers_at_success_threshold() {
        let m = monitor();
        for _ in 0..3 {
            m.record_failure("p", "boom");
        }
        assert!(!m.is_healthy("p"));
        m.record_success("p", 10);
        assert!(!m.is_healthy("p"));
        m.record_success("p", 10);
        assert!(m.is_healthy("p"));
    }

    #[test]
    fn success_resets_failure_streak() {
        let m = monitor();
        m.record_failure("p", "a");
        m.record_failure("p", "b");
        m.record_success("p", 5);
        m.record_failure("p", "c");
        m.record_failure("p", "d");
        // streak restarted, still below threshold
        assert!(m.is_healthy("p"));
    }

    #[test]
    fn average_latency_over_successes() {
        let m = monitor();
        m.record_success("p", 100);
        m.record_success("p", 200);
        let snap = m.snapshot("p").unwrap();
        assert_eq!(snap.average_response_time_ms, 150);
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.failed_requests, 0);
    }

    #[test]
    fn probes_affect_health_but_not_request_totals() {
        let m = monitor();
        for _ in 0..3 {
            m.record_probe("p", false, 1);
        }
        let snap = m.snapshot("p").unwrap();
        assert!(!snap.is_healthy);
        assert_eq!(snap.total_requests, 0);
    }

    #[test]
    fn check_ring_is_bounded() {
        let config = HealthConfig {
            history_size: 4,
            ..HealthConfig::default()
        };
        let m = HealthMonitor::new(config);
        for i in 0..10 {
            m.record_success("p", i);
        }
        let snap = m.snapshot("p").unwrap();
        assert_eq!(snap.recent_checks.len(), 4);
        // newest retained
        assert_eq!(snap.recent_checks.last().unwrap().latency_ms, 9);
    }
}
