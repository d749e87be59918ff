//! Problem model handed to every backend in a race.
//!
//! A `ProblemModel` is built once by the caller and shared read-only
//! (behind an `Arc`) with every adapter task for the lifetime of a race.
//! Expressions are linear so the selector can evaluate constraint
//! violations without consulting a backend.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Combined variable + constraint count at or below which a problem is small.
pub const SMALL_PROBLEM_LIMIT: usize = 10;
/// Combined variable + constraint count at or below which a problem is medium.
pub const MEDIUM_PROBLEM_LIMIT: usize = 100;

/// Domain of a decision variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Continuous,
    Integer,
    Binary,
}

/// A decision variable with optional bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Variable {
    pub name: String,
    pub kind: VariableKind,
    /// Lower bound (`None` = unbounded below; binaries are always 0).
    #[serde(default)]
    pub lower: Option<f64>,
    /// Upper bound (`None` = unbounded above; binaries are always 1).
    #[serde(default)]
    pub upper: Option<f64>,
}

impl Variable {
    pub fn continuous(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Continuous,
            lower: Some(0.0),
            upper: None,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Integer,
            lower: Some(0.0),
            upper: None,
        }
    }

    pub fn binary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Binary,
            lower: Some(0.0),
            upper: Some(1.0),
        }
    }

    pub fn with_bounds(mut self, lower: Option<f64>, upper: Option<f64>) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    /// Effective bounds, with binaries pinned to `[0, 1]`.
    pub fn effective_bounds(&self) -> (Option<f64>, Option<f64>) {
        match self.kind {
            VariableKind::Binary => (Some(0.0), Some(1.0)),
            _ => (self.lower, self.upper),
        }
    }

    pub fn is_integral(&self) -> bool {
        matches!(self.kind, VariableKind::Integer | VariableKind::Binary)
    }
}

/// `constant + Σ coefficient·variable`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LinearExpr {
    #[serde(default)]
    pub terms: BTreeMap<String, f64>,
    #[serde(default)]
    pub constant: f64,
}

impl LinearExpr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `coefficient·variable`, accumulating repeated variables.
    pub fn term(mut self, variable: impl Into<String>, coefficient: f64) -> Self {
        *self.terms.entry(variable.into()).or_insert(0.0) += coefficient;
        self
    }

    pub fn constant(mut self, constant: f64) -> Self {
        self.constant = constant;
        self
    }

    /// Evaluate against an assignment. Variables absent from the assignment
    /// evaluate to zero.
    pub fn evaluate(&self, assignment: &BTreeMap<String, f64>) -> f64 {
        self.terms
            .iter()
            .map(|(name, coef)| coef * assignment.get(name).copied().unwrap_or(0.0))
            .sum::<f64>()
            + self.constant
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintSense {
    #[serde(alias = "<=")]
    LessEqual,
    #[serde(alias = ">=")]
    GreaterEqual,
    #[serde(alias = "=", alias = "==")]
    Equal,
}

/// `expression (sense) rhs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Constraint {
    #[serde(default)]
    pub name: Option<String>,
    pub expression: LinearExpr,
    pub sense: ConstraintSense,
    pub rhs: f64,
}

impl Constraint {
    pub fn new(expression: LinearExpr, sense: ConstraintSense, rhs: f64) -> Self {
        Self {
            name: None,
            expression,
            sense,
            rhs,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Amount by which the assignment violates this constraint (0 when satisfied).
    pub fn violation(&self, assignment: &BTreeMap<String, f64>) -> f64 {
        let lhs = self.expression.evaluate(assignment);
        match self.sense {
            ConstraintSense::LessEqual => (lhs - self.rhs).max(0.0),
            ConstraintSense::GreaterEqual => (self.rhs - lhs).max(0.0),
            ConstraintSense::Equal => (lhs - self.rhs).abs(),
        }
    }

    /// Label used in diagnostics.
    pub fn label(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| format!("c{index}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveSense {
    Minimize,
    Maximize,
}

impl ObjectiveSense {
    /// `+1` for minimisation, `-1` for maximisation.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Minimize => 1.0,
            Self::Maximize => -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Objective {
    pub sense: ObjectiveSense,
    pub expression: LinearExpr,
}

/// Coarse structural class used for capability matching.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ProblemType {
    /// Only continuous variables.
    Linear,
    /// Only binary variables.
    Binary,
    /// Only integer or binary variables, at least one general integer.
    Integer,
    /// Continuous and integral variables together.
    MixedInteger,
}

impl ProblemType {
    pub fn all() -> &'static [ProblemType] {
        &[
            ProblemType::Linear,
            ProblemType::Binary,
            ProblemType::Integer,
            ProblemType::MixedInteger,
        ]
    }
}

impl std::fmt::Display for ProblemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Binary => write!(f, "binary"),
            Self::Integer => write!(f, "integer"),
            Self::MixedInteger => write!(f, "mixed_integer"),
        }
    }
}

/// Size bucket derived from the variable + constraint count.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    pub fn from_count(count: usize) -> Self {
        if count <= SMALL_PROBLEM_LIMIT {
            Self::Small
        } else if count <= MEDIUM_PROBLEM_LIMIT {
            Self::Medium
        } else {
            Self::Large
        }
    }

    pub fn all() -> &'static [SizeClass] {
        &[SizeClass::Small, SizeClass::Medium, SizeClass::Large]
    }
}

impl std::fmt::Display for SizeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Small => write!(f, "small"),
            Self::Medium => write!(f, "medium"),
            Self::Large => write!(f, "large"),
        }
    }
}

/// An optimisation problem: variables, constraints, objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProblemModel {
    /// Caller-supplied label, carried into logs and telemetry.
    #[serde(default)]
    pub name: String,
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    pub objective: Objective,
}

impl ProblemModel {
    pub fn new(name: impl Into<String>, objective: Objective) -> Self {
        Self {
            name: name.into(),
            variables: Vec::new(),
            constraints: Vec::new(),
            objective,
        }
    }

    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn problem_type(&self) -> ProblemType {
        let continuous = self
            .variables
            .iter()
            .filter(|v| v.kind == VariableKind::Continuous)
            .count();
        let binary = self
            .variables
            .iter()
            .filter(|v| v.kind == VariableKind::Binary)
            .count();
        let total = self.variables.len();

        if continuous == total {
            ProblemType::Linear
        } else if binary == total {
            ProblemType::Binary
        } else if continuous == 0 {
            ProblemType::Integer
        } else {
            ProblemType::MixedInteger
        }
    }

    pub fn size_class(&self) -> SizeClass {
        SizeClass::from_count(self.variables.len() + self.constraints.len())
    }
}
