//! Per-adapter solve result.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Outcome of one adapter invocation. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SolveStatus {
    Optimal,
    Feasible,
    Infeasible,
    Unbounded,
    Timeout,
    Error,
}

impl SolveStatus {
    /// Whether a result with this status may carry a usable solution.
    pub fn is_solution(&self) -> bool {
        matches!(self, Self::Optimal | Self::Feasible)
    }

    /// Whether the backend itself misbehaved (as opposed to a valid
    /// mathematical verdict such as infeasible).
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Timeout | Self::Error)
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Optimal => "OPTIMAL",
            Self::Feasible => "FEASIBLE",
            Self::Infeasible => "INFEASIBLE",
            Self::Unbounded => "UNBOUNDED",
            Self::Timeout => "TIMEOUT",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Result produced by a single backend for a single race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SolveResult {
    pub solver_id: String,
    pub status: SolveStatus,
    #[serde(default)]
    pub objective_value: Option<f64>,
    #[serde(default)]
    pub variable_assignment: BTreeMap<String, f64>,
    /// Wall-clock time spent inside the adapter.
    #[serde(default, with = "duration_secs")]
    #[schemars(with = "f64")]
    pub solve_time: Duration,
    #[serde(default)]
    pub iterations: Option<u64>,
    /// Relative MIP gap reported by the backend, if any.
    #[serde(default)]
    pub gap: Option<f64>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SolveResult {
    pub fn new(solver_id: impl Into<String>, status: SolveStatus) -> Self {
        Self {
            solver_id: solver_id.into(),
            status,
            objective_value: None,
            variable_assignment: BTreeMap::new(),
            solve_time: Duration::ZERO,
            iterations: None,
            gap: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// A solution-bearing result.
    pub fn solved(
        solver_id: impl Into<String>,
        status: SolveStatus,
        objective_value: f64,
        assignment: impl IntoIterator<Item = (String, f64)>,
    ) -> Self {
        let mut result = Self::new(solver_id, status);
        result.objective_value = Some(objective_value);
        result.variable_assignment = assignment.into_iter().collect();
        result
    }

    /// An `ERROR` result carrying the failure reason in metadata.
    pub fn error(solver_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(solver_id, SolveStatus::Error).with_reason(reason)
    }

    /// A `TIMEOUT` result carrying the reason in metadata.
    pub fn timeout(solver_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(solver_id, SolveStatus::Timeout).with_reason(reason)
    }

    pub fn with_solve_time(mut self, solve_time: Duration) -> Self {
        self.solve_time = solve_time;
        self
    }

    pub fn with_gap(mut self, gap: f64) -> Self {
        self.gap = Some(gap);
        self
    }

    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = Some(iterations);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.metadata
            .insert("reason".into(), serde_json::Value::String(reason.into()));
        self
    }

    /// Failure reason recorded in metadata, if any.
    pub fn reason(&self) -> Option<&str> {
        self.metadata.get("reason").and_then(|v| v.as_str())
    }
}

/// `Duration` as fractional seconds on the wire.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
