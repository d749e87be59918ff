//! Parallel solver race.
//!
//! ```text
//! PENDING ──launch──► RUNNING ──all tasks returned──► COMPLETED
//!                        │
//!                        └──global deadline, tasks outstanding──► TIMED_OUT
//! ```
//!
//! - [`coordinator`]: fan-out under deadlines and the shared adapter budget
//! - [`selector`]: validation and winner selection over collected results
//! - [`result`]: per-adapter result type

pub mod coordinator;
pub mod result;
pub mod selector;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::problem::{ProblemType, SizeClass};

pub use coordinator::{RaceCoordinator, RaceOutcome, SamplerFactory, SharedRaceCoordinator};
pub use result::{SolveResult, SolveStatus};
pub use selector::{Decision, Priority, RejectReason, Rejection, Selection};

/// Hard failures surfaced to the caller of `run_race`. Everything that goes
/// wrong inside an adapter is reported as data in the outcome instead.
#[derive(Debug, thiserror::Error)]
pub enum RaceError {
    #[error("no registered backend supports {problem_type} problems of size {size_class}")]
    CapabilityMismatch {
        problem_type: ProblemType,
        size_class: SizeClass,
    },

    #[error("invalid race configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("coordinator at capacity ({limit} races in flight)")]
    Overloaded { limit: usize },

    #[error("coordinator is shutting down")]
    ShuttingDown,
}

pub type RaceResult<T> = Result<T, RaceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RaceState {
    Pending,
    Running,
    Completed,
    TimedOut,
}

impl RaceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut)
    }
}

impl fmt::Display for RaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::TimedOut => "TIMED_OUT",
        };
        write!(f, "{s}")
    }
}
