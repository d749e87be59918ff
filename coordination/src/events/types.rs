//! Race and consensus lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::consensus::ConsensusAlgorithm;
use crate::problem::{ProblemType, SizeClass};
use crate::race::RaceState;
use crate::race::result::SolveStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaceEvent {
    /// Candidates chosen and adapter tasks about to launch.
    RaceStarted {
        race_id: Uuid,
        problem_type: ProblemType,
        size_class: SizeClass,
        candidates: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// An adapter returned (or failed) before the race deadline.
    AdapterFinished {
        race_id: Uuid,
        solver_id: String,
        status: SolveStatus,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// An adapter was still running when the deadline passed.
    AdapterCancelled {
        race_id: Uuid,
        solver_id: String,
        timestamp: DateTime<Utc>,
    },

    RaceFinished {
        race_id: Uuid,
        state: RaceState,
        winner: Option<String>,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    ConsensusComputed {
        algorithm: ConsensusAlgorithm,
        participating: usize,
        failed: usize,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },
}

impl RaceEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            RaceEvent::RaceStarted { timestamp, .. }
            | RaceEvent::AdapterFinished { timestamp, .. }
            | RaceEvent::AdapterCancelled { timestamp, .. }
            | RaceEvent::RaceFinished { timestamp, .. }
            | RaceEvent::ConsensusComputed { timestamp, .. } => *timestamp,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            RaceEvent::RaceStarted { .. } => "race_started",
            RaceEvent::AdapterFinished { .. } => "adapter_finished",
            RaceEvent::AdapterCancelled { .. } => "adapter_cancelled",
            RaceEvent::RaceFinished { .. } => "race_finished",
            RaceEvent::ConsensusComputed { .. } => "consensus_computed",
        }
    }

    /// Race the event belongs to (consensus events are race-independent).
    pub fn race_id(&self) -> Option<Uuid> {
        match self {
            RaceEvent::RaceStarted { race_id, .. }
            | RaceEvent::AdapterFinished { race_id, .. }
            | RaceEvent::AdapterCancelled { race_id, .. }
            | RaceEvent::RaceFinished { race_id, .. } => Some(*race_id),
            RaceEvent::ConsensusComputed { .. } => None,
        }
    }
}
