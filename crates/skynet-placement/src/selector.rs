//! Gateway selection: hard filter, rank, deterministic tie-break.
//!
//! `select` is a pure function of the gateway list and the request: equal
//! inputs always yield the same gateway id. Ties on score go to the gateway
//! with fewer active jobs, then to the lexicographically smallest id.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use skynet_state::{Gateway, HealthStatus, Task};

use crate::scorer::{GatewayScore, ScoringWeights, score_gateway};

/// No registered gateway is healthy enough and capable enough.
///
/// A capacity problem, not a task defect: callers release the task.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("no gateway offers {required:?} ({registered} registered)")]
pub struct NoCandidateError {
    pub required: BTreeSet<String>,
    pub registered: usize,
}

/// What a task needs from a gateway.
#[derive(Debug, Clone, Default)]
pub struct SelectionRequest {
    pub required: BTreeSet<String>,
    /// Bonus capabilities, scored but not filtered.
    pub preferred: BTreeSet<String>,
    /// Pinned gateway; wins whenever it survives the hard filter.
    pub preferred_gateway: Option<String>,
}

impl SelectionRequest {
    pub fn requiring(required: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

impl From<&Task> for SelectionRequest {
    fn from(task: &Task) -> Self {
        Self {
            required: task.required_capabilities.clone(),
            preferred: task.preferred_capabilities.clone(),
            preferred_gateway: task.preferred_gateway.clone(),
        }
    }
}

/// A gateway eliminated by the hard filter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub gateway_id: String,
    pub reason: String,
}

/// Full scoring breakdown for observability. Mutates nothing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Explanation {
    pub required: BTreeSet<String>,
    /// Surviving candidates, best first.
    pub candidates: Vec<GatewayScore>,
    pub rejected: Vec<Rejection>,
    pub chosen: Option<String>,
}

/// Scores gateways with a fixed set of weights.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    weights: ScoringWeights,
}

impl Selector {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Pick the best gateway for `request`.
    pub fn select(
        &self,
        gateways: &[Gateway],
        request: &SelectionRequest,
    ) -> Result<String, NoCandidateError> {
        let explanation = self.explain(gateways, request);
        match explanation.chosen {
            Some(id) => {
                debug!(gateway_id = %id, candidates = explanation.candidates.len(), "gateway selected");
                Ok(id)
            }
            None => Err(NoCandidateError {
                required: request.required.clone(),
                registered: gateways.len(),
            }),
        }
    }

    /// Score every gateway and report the choice `select` would make.
    pub fn explain(&self, gateways: &[Gateway], request: &SelectionRequest) -> Explanation {
        let mut candidates = Vec::new();
        let mut rejected = Vec::new();

        for gw in gateways {
            match score_gateway(gw, &request.required, &request.preferred, &self.weights) {
                Some(score) => candidates.push(score),
                None => rejected.push(Rejection {
                    gateway_id: gw.gateway_id.clone(),
                    reason: rejection_reason(gw, &request.required),
                }),
            }
        }

        candidates.sort_by(rank);

        let pinned = request
            .preferred_gateway
            .as_deref()
            .filter(|id| candidates.iter().any(|c| c.gateway_id == *id));
        let chosen = pinned
            .map(str::to_string)
            .or_else(|| candidates.first().map(|c| c.gateway_id.clone()));

        Explanation {
            required: request.required.clone(),
            candidates,
            rejected,
            chosen,
        }
    }
}

/// Best first: score desc, then active jobs asc, then id asc.
fn rank(a: &GatewayScore, b: &GatewayScore) -> Ordering {
    b.total
        .partial_cmp(&a.total)
        .unwrap_or(Ordering::Equal)
        .then(a.active_jobs.cmp(&b.active_jobs))
        .then_with(|| a.gateway_id.cmp(&b.gateway_id))
}

fn rejection_reason(gw: &Gateway, required: &BTreeSet<String>) -> String {
    if gw.status == HealthStatus::Unhealthy {
        return "unhealthy".to_string();
    }
    let missing: Vec<&str> = required
        .difference(&gw.capabilities)
        .map(String::as_str)
        .collect();
    format!("missing capabilities: {}", missing.join(", "))
}
