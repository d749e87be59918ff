//! Result validation and winner selection.
//!
//! Ranking:
//! 1. Status is OPTIMAL or FEASIBLE and the assignment validates (hard gate)
//! 2. Priority: OPTIMAL > FEASIBLE (OPTIMAL above the gap tolerance counts as FEASIBLE)
//! 3. Score: `sign(sense) · (−objective) · w1 + (−solve_secs) · w2`, higher wins
//! 4. Lowest solve time
//! 5. Input (registration) order
//!
//! Nothing is ever substituted for a missing solution: with no valid
//! candidate the selector returns [`Selection::NoSolution`] carrying every
//! result it was given.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::result::{SolveResult, SolveStatus};
use crate::config::SolveConfig;
use crate::problem::ProblemModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Feasible,
    Optimal,
}

/// Why a solution-bearing result was not eligible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    MissingObjective,
    NonFiniteValue { variable: String },
    ConstraintViolation { constraint: String, violation: f64 },
    BoundViolation { variable: String, violation: f64 },
    IntegralityViolation { variable: String, value: f64 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingObjective => write!(f, "missing or non-finite objective value"),
            Self::NonFiniteValue { variable } => write!(f, "non-finite value for {variable}"),
            Self::ConstraintViolation {
                constraint,
                violation,
            } => write!(f, "constraint {constraint} violated by {violation:.3e}"),
            Self::BoundViolation {
                variable,
                violation,
            } => write!(f, "bounds of {variable} violated by {violation:.3e}"),
            Self::IntegralityViolation { variable, value } => {
                write!(f, "{variable} = {value} is not integral")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub solver_id: String,
    pub status: SolveStatus,
    pub reason: RejectReason,
}

/// The selected solution and why it won.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub winner: SolveResult,
    pub priority: Priority,
    pub score: f64,
    pub rationale: String,
    /// Backends whose status carried no solution (ERROR, TIMEOUT, INFEASIBLE, ...).
    pub failed_backends: Vec<String>,
    /// Backends that claimed a solution which did not validate.
    pub rejected: Vec<Rejection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Selection {
    Winner(Decision),
    NoSolution {
        failed: Vec<SolveResult>,
        rejected: Vec<Rejection>,
    },
}

impl Selection {
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::Winner(d) => Some(d),
            Self::NoSolution { .. } => None,
        }
    }

    pub fn winner_id(&self) -> Option<&str> {
        self.decision().map(|d| d.winner.solver_id.as_str())
    }
}

/// Check a solution-bearing result against the model.
///
/// Variables absent from the assignment are taken as zero.
pub fn validate(
    result: &SolveResult,
    model: &ProblemModel,
    config: &SolveConfig,
) -> Result<(), RejectReason> {
    match result.objective_value {
        Some(v) if v.is_finite() => {}
        _ => return Err(RejectReason::MissingObjective),
    }

    if let Some((name, _)) = result
        .variable_assignment
        .iter()
        .find(|(_, v)| !v.is_finite())
    {
        return Err(RejectReason::NonFiniteValue {
            variable: name.clone(),
        });
    }

    let tol = config.feasibility_tolerance;
    for variable in &model.variables {
        let value = result
            .variable_assignment
            .get(&variable.name)
            .copied()
            .unwrap_or(0.0);
        let (lower, upper) = variable.effective_bounds();
        let below = lower.map_or(0.0, |lo| lo - value);
        let above = upper.map_or(0.0, |hi| value - hi);
        let violation = below.max(above);
        if violation > tol {
            return Err(RejectReason::BoundViolation {
                variable: variable.name.clone(),
                violation,
            });
        }
        if variable.is_integral() && (value - value.round()).abs() > config.integrality_tolerance {
            return Err(RejectReason::IntegralityViolation {
                variable: variable.name.clone(),
                value,
            });
        }
    }

    for (index, constraint) in model.constraints.iter().enumerate() {
        let violation = constraint.violation(&result.variable_assignment);
        if violation > tol {
            return Err(RejectReason::ConstraintViolation {
                constraint: constraint.label(index),
                violation,
            });
        }
    }

    Ok(())
}

pub fn priority(result: &SolveResult, config: &SolveConfig) -> Option<Priority> {
    match result.status {
        SolveStatus::Optimal => match result.gap {
            Some(gap) if gap > config.gap_tolerance => Some(Priority::Feasible),
            _ => Some(Priority::Optimal),
        },
        SolveStatus::Feasible => Some(Priority::Feasible),
        _ => None,
    }
}

/// Weighted objective/speed score. `objective` must be present.
pub fn score(result: &SolveResult, model: &ProblemModel, config: &SolveConfig) -> f64 {
    let objective = result.objective_value.unwrap_or(f64::NAN);
    let sign = model.objective.sense.sign();
    sign * (-objective) * config.objective_weight
        + (-result.solve_time.as_secs_f64()) * config.speed_weight
}

struct Candidate<'a> {
    order: usize,
    result: &'a SolveResult,
    priority: Priority,
    score: f64,
}

fn rank(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.score.total_cmp(&a.score))
        .then_with(|| a.result.solve_time.cmp(&b.result.solve_time))
        .then_with(|| a.order.cmp(&b.order))
}

/// Pick the winning result from a completed race.
pub fn select(results: &[SolveResult], model: &ProblemModel, config: &SolveConfig) -> Selection {
    let mut failed_backends = Vec::new();
    let mut rejected = Vec::new();
    let mut candidates = Vec::new();

    for (order, result) in results.iter().enumerate() {
        let Some(priority) = priority(result, config) else {
            failed_backends.push(result.solver_id.clone());
            continue;
        };
        if let Err(reason) = validate(result, model, config) {
            debug!(solver_id = %result.solver_id, %reason, "Result rejected by validator");
            rejected.push(Rejection {
                solver_id: result.solver_id.clone(),
                status: result.status,
                reason,
            });
            continue;
        }
        candidates.push(Candidate {
            order,
            result,
            priority,
            score: score(result, model, config),
        });
    }

    candidates.sort_by(rank);

    let Some(best) = candidates.first() else {
        return Selection::NoSolution {
            failed: results.to_vec(),
            rejected,
        };
    };

    let rationale = if candidates.len() == 1 {
        format!(
            "Only valid solution: {} ({}, objective {})",
            best.result.solver_id,
            best.result.status,
            best.result.objective_value.unwrap_or(f64::NAN),
        )
    } else {
        format!(
            "Best of {} valid solutions: {} ({:?} priority, score {:.4}, {:.3}s)",
            candidates.len(),
            best.result.solver_id,
            best.priority,
            best.score,
            best.result.solve_time.as_secs_f64(),
        )
    };

    Selection::Winner(Decision {
        winner: best.result.clone(),
        priority: best.priority,
        score: best.score,
        rationale,
        failed_backends,
        rejected,
    })
}
