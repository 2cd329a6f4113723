//! Gateway scoring for dispatch decisions.
//!
//! Each surviving gateway gets a weighted score in `[0, 1]` built from:
//! - **Health**: healthy beats degraded
//! - **Load**: free share of the gateway's capacity
//! - **Capability**: overlap with the task's bonus capabilities
//! - **Success**: smoothed historical success rate
//! - **Latency**: average dispatch latency against a ceiling

use std::collections::BTreeSet;

use serde::Serialize;

use skynet_core::ScoringSettings;
use skynet_state::{Gateway, HealthStatus};

/// Samples below which the success rate is blended toward neutral.
const MIN_CONFIDENT_SAMPLES: u64 = 3;

/// Score given when a factor has no data.
const NEUTRAL: f64 = 0.5;

/// Scored candidate for a single gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayScore {
    pub gateway_id: String,
    /// Weighted total (higher = better). Range: 0.0..=1.0.
    pub total: f64,
    pub active_jobs: u32,
    pub breakdown: ScoreBreakdown,
}

/// Individual factor scores, each in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub health: f64,
    pub load: f64,
    pub capability: f64,
    pub success: f64,
    pub latency: f64,
}

/// Weights for the scoring factors.
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub health: f64,
    pub load: f64,
    pub capability: f64,
    pub success: f64,
    pub latency: f64,
    /// Average latency at or above this scores 0.
    pub latency_ceiling_ms: u64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            health: 0.30,
            load: 0.25,
            capability: 0.25,
            success: 0.15,
            latency: 0.05,
            latency_ceiling_ms: 60_000,
        }
    }
}

impl From<&ScoringSettings> for ScoringWeights {
    fn from(s: &ScoringSettings) -> Self {
        Self {
            health: s.health,
            load: s.load,
            capability: s.capability,
            success: s.success,
            latency: s.latency,
            latency_ceiling_ms: s.latency_ceiling_ms,
        }
    }
}

/// Score a single gateway. Returns `None` if the hard filter rejects it:
/// unhealthy, or missing any required capability.
pub fn score_gateway(
    gateway: &Gateway,
    required: &BTreeSet<String>,
    preferred: &BTreeSet<String>,
    weights: &ScoringWeights,
) -> Option<GatewayScore> {
    if gateway.status == HealthStatus::Unhealthy {
        return None;
    }
    if !required.is_subset(&gateway.capabilities) {
        return None;
    }

    let breakdown = ScoreBreakdown {
        health: health_score(gateway.status),
        load: load_score(gateway.active_jobs, gateway.capacity),
        capability: capability_score(&gateway.capabilities, preferred),
        success: success_score(gateway.success_count, gateway.failure_count),
        latency: latency_score(gateway.avg_latency_ms, weights.latency_ceiling_ms),
    };

    let total = weights.health * breakdown.health
        + weights.load * breakdown.load
        + weights.capability * breakdown.capability
        + weights.success * breakdown.success
        + weights.latency * breakdown.latency;

    Some(GatewayScore {
        gateway_id: gateway.gateway_id.clone(),
        total,
        active_jobs: gateway.active_jobs,
        breakdown,
    })
}

pub fn health_score(status: HealthStatus) -> f64 {
    match status {
        HealthStatus::Healthy => 1.0,
        HealthStatus::Degraded => 0.5,
        HealthStatus::Unhealthy => 0.0,
    }
}

/// `1 - active/capacity`, clamped. Zero capacity scores 0.
pub fn load_score(active_jobs: u32, capacity: u32) -> f64 {
    if capacity == 0 {
        return 0.0;
    }
    (1.0 - f64::from(active_jobs) / f64::from(capacity)).clamp(0.0, 1.0)
}

/// Fraction of bonus capabilities the gateway also offers; 1.0 with none.
pub fn capability_score(offered: &BTreeSet<String>, preferred: &BTreeSet<String>) -> f64 {
    if preferred.is_empty() {
        return 1.0;
    }
    let matched = preferred.intersection(offered).count();
    matched as f64 / preferred.len() as f64
}

/// Laplace-smoothed success rate, pulled toward neutral on few samples.
pub fn success_score(successes: u64, failures: u64) -> f64 {
    let total = successes + failures;
    if total == 0 {
        return NEUTRAL;
    }

    let rate = (successes + 1) as f64 / (total + 2) as f64;
    if total < MIN_CONFIDENT_SAMPLES {
        let confidence = total as f64 / MIN_CONFIDENT_SAMPLES as f64;
        rate * confidence + NEUTRAL * (1.0 - confidence)
    } else {
        rate
    }
}

/// `1 - avg/ceiling`, clamped. No samples (or no ceiling) is neutral.
pub fn latency_score(avg_latency_ms: Option<f64>, ceiling_ms: u64) -> f64 {
    match avg_latency_ms {
        Some(avg) if ceiling_ms > 0 => (1.0 - avg / ceiling_ms as f64).clamp(0.0, 1.0),
        _ => NEUTRAL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_gateway(id: &str, caps: &[&str]) -> Gateway {
        Gateway {
            gateway_id: id.to_string(),
            endpoint: format!("http://{id}:8080"),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            capacity: 4,
            status: HealthStatus::Healthy,
            last_heartbeat: 1000,
            active_jobs: 0,
            success_count: 0,
            failure_count: 0,
            avg_latency_ms: None,
            registered_at: 1000,
        }
    }

    fn caps(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn rejects_unhealthy_gateway() {
        let mut gw = make_gateway("g1", &["docker"]);
        gw.status = HealthStatus::Unhealthy;
        let weights = ScoringWeights::default();
        assert!(score_gateway(&gw, &caps(&["docker"]), &BTreeSet::new(), &weights).is_none());
    }

    #[test]
    fn rejects_missing_required_capability() {
        let gw = make_gateway("g1", &["shell"]);
        let weights = ScoringWeights::default();
        assert!(score_gateway(&gw, &caps(&["docker"]), &BTreeSet::new(), &weights).is_none());
    }

    #[test]
    fn fresh_healthy_gateway_score() {
        let gw = make_gateway("g1", &["shell"]);
        let weights = ScoringWeights::default();
        let score = score_gateway(&gw, &BTreeSet::new(), &BTreeSet::new(), &weights).unwrap();

        assert_eq!(score.breakdown.health, 1.0);
        assert_eq!(score.breakdown.load, 1.0);
        assert_eq!(score.breakdown.capability, 1.0);
        assert_eq!(score.breakdown.success, 0.5);
        assert_eq!(score.breakdown.latency, 0.5);
        // 0.30 + 0.25 + 0.25 + 0.15 * 0.5 + 0.05 * 0.5
        assert!((score.total - 0.90).abs() < 1e-9);
    }

    #[test]
    fn degraded_scores_half_health() {
        let mut gw = make_gateway("g1", &[]);
        gw.status = HealthStatus::Degraded;
        let weights = ScoringWeights::default();
        let score = score_gateway(&gw, &BTreeSet::new(), &BTreeSet::new(), &weights).unwrap();
        assert_eq!(score.breakdown.health, 0.5);
    }

    #[test]
    fn load_score_bounds() {
        assert_eq!(load_score(0, 4), 1.0);
        assert_eq!(load_score(2, 4), 0.5);
        assert_eq!(load_score(9, 4), 0.0);
        assert_eq!(load_score(0, 0), 0.0);
    }

    #[test]
    fn capability_score_counts_bonus_overlap() {
        let offered = caps(&["shell", "docker", "gpu"]);
        assert_eq!(capability_score(&offered, &BTreeSet::new()), 1.0);
        assert_eq!(capability_score(&offered, &caps(&["gpu", "tpu"])), 0.5);
        assert_eq!(capability_score(&offered, &caps(&["tpu"])), 0.0);
    }

    #[test]
    fn success_score_smoothing() {
        assert_eq!(success_score(0, 0), 0.5);
        // Plenty of samples: plain Laplace rate.
        assert!((success_score(8, 0) - 0.9).abs() < 1e-9);
        // One success: rate 2/3, confidence 1/3 → 2/9 + 1/3.
        assert!((success_score(1, 0) - (2.0 / 9.0 + 1.0 / 3.0)).abs() < 1e-9);
        assert!(success_score(0, 10) < 0.1);
    }

    #[test]
    fn latency_score_against_ceiling() {
        assert_eq!(latency_score(None, 60_000), 0.5);
        assert_eq!(latency_score(Some(0.0), 60_000), 1.0);
        assert_eq!(latency_score(Some(30_000.0), 60_000), 0.5);
        assert_eq!(latency_score(Some(120_000.0), 60_000), 0.0);
        assert_eq!(latency_score(Some(10.0), 0), 0.5);
    }

    #[test]
    fn weights_from_settings() {
        let settings = ScoringSettings::default();
        let weights = ScoringWeights::from(&settings);
        assert_eq!(weights.health, 0.30);
        assert_eq!(weights.latency_ceiling_ms, 60_000);
    }
}
