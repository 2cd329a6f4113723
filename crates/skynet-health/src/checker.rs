//! Probe logic and per-target failure tracking.

use std::time::Duration;

use tracing::{debug, warn};

use skynet_gateway::{DispatchError, GatewayClient};
use skynet_state::HealthStatus;

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The target answered and reported itself usable.
    Healthy,
    /// The target answered but is not usable.
    Unhealthy,
    /// The probe could not be executed (connection error, timeout).
    Failed,
}

/// Tracks consecutive probe results for a single gateway.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Failures before marking unhealthy.
    unhealthy_threshold: u32,
    /// Successes needed to recover.
    healthy_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
    max_backoff: Duration,
    /// Epoch millis before which the target is left alone.
    next_probe_at: u64,
}

impl HealthTracker {
    pub fn new(unhealthy_threshold: u32, interval: Duration) -> Self {
        Self::with_thresholds(unhealthy_threshold, 1, interval)
    }

    pub fn with_thresholds(
        unhealthy_threshold: u32,
        healthy_threshold: u32,
        interval: Duration,
    ) -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
            max_backoff: Duration::from_secs(60),
            next_probe_at: 0,
        }
    }

    /// Record a probe result and return the new status.
    ///
    /// Failures below the threshold degrade; reaching it marks unhealthy.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        match result {
            ProbeResult::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                self.current_backoff = self.base_interval;

                if self.consecutive_successes >= self.healthy_threshold {
                    if self.status != HealthStatus::Healthy {
                        debug!(successes = self.consecutive_successes, "target recovered to healthy");
                    }
                    self.status = HealthStatus::Healthy;
                }
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);

                if self.consecutive_failures >= self.unhealthy_threshold {
                    if self.status != HealthStatus::Unhealthy {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.unhealthy_threshold,
                            "target marked unhealthy"
                        );
                    }
                    self.status = HealthStatus::Unhealthy;
                } else if self.status == HealthStatus::Healthy {
                    self.status = HealthStatus::Degraded;
                }
            }
        }

        self.status
    }

    /// Record a result seen at `now` and hold off the next check for the
    /// current backoff.
    pub fn record_at(&mut self, result: ProbeResult, now: u64) -> HealthStatus {
        let status = self.record(result);
        let wait = u64::try_from(self.current_backoff.as_millis()).unwrap_or(u64::MAX);
        self.next_probe_at = now.saturating_add(wait);
        status
    }

    /// Whether the backoff since the last check has elapsed.
    pub fn due(&self, now: u64) -> bool {
        now >= self.next_probe_at
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Backoff before the next probe.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}

/// Probe a gateway's status endpoint.
pub async fn probe_gateway(client: &dyn GatewayClient, endpoint: &str, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, client.get_gateway_status(endpoint)).await {
        Ok(Ok(_)) => ProbeResult::Healthy,
        Ok(Err(DispatchError::Protocol(e))) => {
            debug!(%endpoint, error = %e, "gateway probe got a bad answer");
            ProbeResult::Unhealthy
        }
        Ok(Err(e)) => {
            debug!(%endpoint, error = %e, "gateway probe failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(%endpoint, "gateway probe timed out");
            ProbeResult::Failed
        }
    }
}

/// Probe the worker behind a gateway. A reachable gateway reporting no
/// connected agent is unhealthy.
pub async fn probe_worker(client: &dyn GatewayClient, endpoint: &str, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, client.get_worker_status(endpoint)).await {
        Ok(Ok(status)) if status.agent_connected == Some(false) => ProbeResult::Unhealthy,
        Ok(Ok(_)) => ProbeResult::Healthy,
        Ok(Err(DispatchError::Protocol(_))) => ProbeResult::Unhealthy,
        Ok(Err(_)) | Err(_) => ProbeResult::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skynet_gateway::MemoryGateway;

    #[test]
    fn tracker_starts_healthy() {
        let tracker = HealthTracker::new(3, Duration::from_secs(5));
        assert_eq!(tracker.status(), HealthStatus::Healthy);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn tracker_degrades_under_threshold() {
        let mut tracker = HealthTracker::new(3, Duration::from_secs(5));
        assert_eq!(tracker.record(ProbeResult::Failed), HealthStatus::Degraded);
        assert_eq!(tracker.record(ProbeResult::Unhealthy), HealthStatus::Degraded);
        assert_eq!(tracker.consecutive_failures(), 2);
    }

    #[test]
    fn tracker_becomes_unhealthy_at_threshold() {
        let mut tracker = HealthTracker::new(3, Duration::from_secs(5));
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.record(ProbeResult::Failed), HealthStatus::Unhealthy);
    }

    #[test]
    fn tracker_recovers_on_success() {
        let mut tracker = HealthTracker::new(2, Duration::from_secs(5));
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.status(), HealthStatus::Unhealthy);
        assert_eq!(tracker.record(ProbeResult::Healthy), HealthStatus::Healthy);
    }

    #[test]
    fn tracker_exponential_backoff() {
        let mut tracker = HealthTracker::with_thresholds(3, 1, Duration::from_secs(1));
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));

        tracker.record(ProbeResult::Unhealthy);
        assert_eq!(tracker.next_interval(), Duration::from_secs(2));
        tracker.record(ProbeResult::Unhealthy);
        assert_eq!(tracker.next_interval(), Duration::from_secs(4));

        tracker.record(ProbeResult::Healthy);
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
    }

    #[test]
    fn tracker_backoff_caps_at_max() {
        let mut tracker = HealthTracker::with_thresholds(100, 1, Duration::from_secs(1));
        for _ in 0..10 {
            tracker.record(ProbeResult::Failed);
        }
        assert_eq!(tracker.next_interval(), Duration::from_secs(60));
    }

    #[test]
    fn failures_push_the_next_check_out() {
        let mut tracker = HealthTracker::with_thresholds(3, 1, Duration::from_secs(1));
        assert!(tracker.due(0));

        tracker.record_at(ProbeResult::Failed, 10_000);
        assert!(!tracker.due(11_999));
        assert!(tracker.due(12_000));

        tracker.record_at(ProbeResult::Failed, 12_000);
        assert!(!tracker.due(15_999));
        assert!(tracker.due(16_000));

        tracker.record_at(ProbeResult::Healthy, 16_000);
        assert!(tracker.due(17_000));
    }

    #[test]
    fn recovery_needs_enough_successes() {
        let mut tracker = HealthTracker::with_thresholds(1, 2, Duration::from_secs(1));
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.status(), HealthStatus::Unhealthy);
        assert_eq!(tracker.record(ProbeResult::Healthy), HealthStatus::Unhealthy);
        assert_eq!(tracker.record(ProbeResult::Healthy), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn probe_results_from_memory_gateway() {
        let gateway = MemoryGateway::new();
        let timeout = Duration::from_millis(100);
        assert_eq!(probe_gateway(&gateway, "mem://a", timeout).await, ProbeResult::Healthy);
        assert_eq!(probe_worker(&gateway, "mem://a", timeout).await, ProbeResult::Healthy);

        gateway.set_agent_connected(false);
        assert_eq!(probe_gateway(&gateway, "mem://a", timeout).await, ProbeResult::Healthy);
        assert_eq!(probe_worker(&gateway, "mem://a", timeout).await, ProbeResult::Unhealthy);

        gateway.set_available(false);
        assert_eq!(probe_gateway(&gateway, "mem://a", timeout).await, ProbeResult::Failed);
    }
}
