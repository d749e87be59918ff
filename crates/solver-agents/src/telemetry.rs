//! Structured telemetry for solver races.
//!
//! One [`RaceRecord`] per race, appended as a JSON line to a telemetry file.
//! [`TelemetryReader`] loads the file back for summaries.

use std::io::Write;
use std::path::Path;

use coordination::monitor::ResourceSummary;
use coordination::problem::{ProblemType, SizeClass};
use coordination::race::{RaceOutcome, RaceState, SolveStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Per-backend line item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRecord {
    pub solver_id: String,
    pub status: SolveStatus,
    pub solve_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceRecord {
    pub race_id: Uuid,
    pub problem: String,
    pub problem_type: ProblemType,
    pub size_class: SizeClass,
    pub state: RaceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winning_objective: Option<f64>,
    pub elapsed_ms: u64,
    pub backends: Vec<BackendRecord>,
    pub resources: ResourceSummary,
    pub timestamp: String,
}

impl RaceRecord {
    pub fn from_outcome(problem: &str, outcome: &RaceOutcome) -> Self {
        let decision = outcome.decision();
        Self {
            race_id: outcome.race_id,
            problem: problem.to_string(),
            problem_type: outcome.problem_type,
            size_class: outcome.size_class,
            state: outcome.state,
            winner: decision.map(|d| d.winner.solver_id.clone()),
            winning_objective: decision.and_then(|d| d.winner.objective_value),
            elapsed_ms: outcome.elapsed_ms,
            backends: outcome
                .results
                .iter()
                .map(|r| BackendRecord {
                    solver_id: r.solver_id.clone(),
                    status: r.status,
                    solve_time_ms: r.solve_time.as_millis() as u64,
                    objective_value: r.objective_value,
                })
                .collect(),
            resources: outcome.resources.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Append a race record to `path` as one JSON line. Failures are logged.
pub fn append_race(record: &RaceRecord, path: &Path) {
    match serde_json::to_string(record) {
        Ok(json) => {
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{json}") {
                        warn!("Failed to append race telemetry: {e}");
                    } else {
                        info!(path = %path.display(), race_id = %record.race_id, "Appended race telemetry");
                    }
                }
                Err(e) => warn!("Failed to open telemetry file: {e}"),
            }
        }
        Err(e) => warn!("Failed to serialize race telemetry: {e}"),
    }
}

/// Win/run counts for one backend across a telemetry file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendTally {
    pub races: usize,
    pub wins: usize,
    pub timeouts: usize,
    pub errors: usize,
}

/// Reads race telemetry back from a JSONL file.
pub struct TelemetryReader {
    records: Vec<RaceRecord>,
    skipped: usize,
}

impl TelemetryReader {
    /// Load every parseable line; malformed lines are counted and skipped.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut records = Vec::new();
        let mut skipped = 0;
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    skipped += 1;
                    warn!("Skipping malformed telemetry line: {e}");
                }
            }
        }
        Ok(Self { records, skipped })
    }

    pub fn records(&self) -> &[RaceRecord] {
        &self.records
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn backend_tallies(&self) -> std::collections::BTreeMap<String, BackendTally> {
        let mut tallies = std::collections::BTreeMap::<String, BackendTally>::new();
        for record in &self.records {
            for backend in &record.backends {
                let tally = tallies.entry(backend.solver_id.clone()).or_default();
                tally.races += 1;
                match backend.status {
                    SolveStatus::Timeout => tally.timeouts += 1,
                    SolveStatus::Error => tally.errors += 1,
                    _ => {}
                }
                if record.winner.as_deref() == Some(backend.solver_id.as_str()) {
                    tally.wins += 1;
                }
            }
        }
        tallies
    }

    pub fn timed_out_races(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.state == RaceState::TimedOut)
            .count()
    }
}
