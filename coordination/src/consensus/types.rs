//! Agent results in, consensus result out.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::race::result::{SolveResult, SolveStatus};

/// Confidence assigned to a solver result carrying an OPTIMAL solution.
pub const OPTIMAL_CONFIDENCE: f64 = 1.0;
/// Confidence assigned to a solver result carrying a FEASIBLE solution.
pub const FEASIBLE_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusAlgorithm {
    WeightedVoting,
    ConfidenceAggregation,
    PeerValidation,
    Hybrid,
}

impl ConsensusAlgorithm {
    pub fn all() -> &'static [ConsensusAlgorithm] {
        &[
            Self::WeightedVoting,
            Self::ConfidenceAggregation,
            Self::PeerValidation,
            Self::Hybrid,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WeightedVoting => "weighted_voting",
            Self::ConfidenceAggregation => "confidence_aggregation",
            Self::PeerValidation => "peer_validation",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for ConsensusAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown consensus algorithm '{0}'")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for ConsensusAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::all()
            .iter()
            .copied()
            .find(|a| a.as_str() == normalized)
            .ok_or_else(|| UnknownAlgorithm(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Success,
    #[serde(alias = "error")]
    Failed,
    Timeout,
}

/// Output of one parallel producer (solver or analysis agent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,
    /// Specialization tag, looked up in the relevance table.
    #[serde(default)]
    pub specialization: String,
    /// Self-reported confidence, clamped to `[0, 1]`.
    #[serde(default, deserialize_with = "unit_interval")]
    pub confidence: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_status")]
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set by best-effort extractors; scales `confidence` when present.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_unit_interval"
    )]
    pub parse_confidence: Option<f64>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

fn default_status() -> AgentStatus {
    AgentStatus::Success
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn unit_interval<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    f64::deserialize(d).map(clamp_unit)
}

fn optional_unit_interval<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Option::<f64>::deserialize(d).map(|v| v.map(clamp_unit))
}

impl AgentResult {
    pub fn new(
        agent_id: impl Into<String>,
        specialization: impl Into<String>,
        confidence: f64,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            specialization: specialization.into(),
            confidence: clamp_unit(confidence),
            timestamp: Utc::now(),
            status: AgentStatus::Success,
            error: None,
            parse_confidence: None,
            payload,
        }
    }

    pub fn failed(
        agent_id: impl Into<String>,
        specialization: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: AgentStatus::Failed,
            error: Some(error.into()),
            ..Self::new(agent_id, specialization, 0.0, Map::new())
        }
    }

    pub fn timed_out(agent_id: impl Into<String>, specialization: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Timeout,
            error: Some("timed out".into()),
            ..Self::new(agent_id, specialization, 0.0, Map::new())
        }
    }

    pub fn with_parse_confidence(mut self, parse_confidence: f64) -> Self {
        self.parse_confidence = Some(clamp_unit(parse_confidence));
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == AgentStatus::Success
    }

    /// Confidence scaled by the extractor's parse confidence.
    pub fn effective_confidence(&self) -> f64 {
        self.confidence * self.parse_confidence.unwrap_or(1.0)
    }

    /// Human-readable reason for a failed result.
    pub fn failure_reason(&self) -> String {
        match (&self.error, self.status) {
            (Some(e), _) => e.clone(),
            (None, AgentStatus::Timeout) => "timed out".into(),
            (None, _) => "failed".into(),
        }
    }

    /// Lift a race result into the consensus domain.
    ///
    /// OPTIMAL and FEASIBLE become successful agents; every other status is
    /// a failed agent with the status (and backend reason) as its error.
    pub fn from_solve_result(result: &SolveResult, specialization: impl Into<String>) -> Self {
        let confidence = match result.status {
            SolveStatus::Optimal => OPTIMAL_CONFIDENCE,
            SolveStatus::Feasible => FEASIBLE_CONFIDENCE,
            status => {
                let reason = match result.reason() {
                    Some(r) => format!("{status}: {r}"),
                    None => status.to_string(),
                };
                let failed = Self::failed(result.solver_id.clone(), specialization, reason);
                return if status == SolveStatus::Timeout {
                    Self {
                        status: AgentStatus::Timeout,
                        ..failed
                    }
                } else {
                    failed
                };
            }
        };

        let mut payload = Map::new();
        payload.insert("status".into(), Value::String(result.status.to_string()));
        if let Some(obj) = result.objective_value.and_then(serde_json::Number::from_f64) {
            payload.insert("objective_value".into(), Value::Number(obj));
        }
        if let Some(secs) = serde_json::Number::from_f64(result.solve_time.as_secs_f64()) {
            payload.insert("solve_time_secs".into(), Value::Number(secs));
        }
        let variables: Map<String, Value> = result
            .variable_assignment
            .iter()
            .filter_map(|(k, v)| serde_json::Number::from_f64(*v).map(|n| (k.clone(), Value::Number(n))))
            .collect();
        payload.insert("variables".into(), Value::Object(variables));

        Self::new(result.solver_id.clone(), specialization, confidence, payload)
    }
}

/// Diagnostics attached to every consensus result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusMetadata {
    pub successful_agents: Vec<String>,
    pub failed_agents: Vec<String>,
    pub failure_reasons: BTreeMap<String, String>,
    /// Final normalised weight per successful agent.
    pub weights: BTreeMap<String, f64>,
    /// Set when weighting fell back to equal weights.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    /// Set when no consensus could be formed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-component confidence for the hybrid algorithm.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub component_confidences: BTreeMap<String, f64>,
    pub computed_at: DateTime<Utc>,
}

/// Terminal result of one aggregation. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// Merged payload; `None` when every agent failed.
    pub consensus_value: Option<Value>,
    pub confidence: f64,
    pub agreement_score: f64,
    pub participating_agents: Vec<String>,
    pub failed_agents: Vec<String>,
    pub algorithm_used: ConsensusAlgorithm,
    pub metadata: ConsensusMetadata,
}

impl ConsensusResult {
    /// Whether aggregation produced no value.
    pub fn is_failure(&self) -> bool {
        self.consensus_value.is_none()
    }

    /// Look up a top-level field of the merged payload.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.consensus_value.as_ref()?.get(name)
    }
}
