//! Pairwise similarity and agreement scoring.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::AgentResult;

const EPSILON: f64 = 1e-9;

/// How two agents are compared for the agreement score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementMeasure {
    /// `1 − |c_i − c_j|` over effective confidences.
    #[default]
    ConfidenceDistance,
    /// Field-level payload similarity.
    PayloadSimilarity,
}

/// Similarity of two JSON values in `[0, 1]`.
///
/// Numbers: `1 − |a − b| / max(|a|, |b|)`. Strings, bools, null: equality.
/// Arrays: Jaccard. Objects: [`payload_similarity`]. Mismatched kinds: 0.
pub fn value_similarity(a: &Value, b: &Value) -> f64 {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => numeric_similarity(x, y),
            _ => 0.0,
        },
        (Value::Array(x), Value::Array(y)) => jaccard(x, y),
        (Value::Object(x), Value::Object(y)) => payload_similarity(x, y),
        _ => {
            if a == b {
                1.0
            } else {
                0.0
            }
        }
    }
}

pub fn numeric_similarity(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs()).max(EPSILON);
    (1.0 - (a - b).abs() / scale).clamp(0.0, 1.0)
}

fn jaccard(a: &[Value], b: &[Value]) -> f64 {
    let mut union: Vec<&Value> = Vec::new();
    for v in a.iter().chain(b) {
        if !union.contains(&v) {
            union.push(v);
        }
    }
    if union.is_empty() {
        return 1.0;
    }
    let shared = union
        .iter()
        .filter(|v| a.contains(**v) && b.contains(**v))
        .count();
    shared as f64 / union.len() as f64
}

/// Mean per-field similarity over the union of keys; a field present on
/// only one side scores 0. Two empty payloads are identical.
pub fn payload_similarity(a: &Map<String, Value>, b: &Map<String, Value>) -> f64 {
    let mut keys: Vec<&String> = a.keys().collect();
    keys.extend(b.keys().filter(|k| !a.contains_key(*k)));
    if keys.is_empty() {
        return 1.0;
    }
    let total: f64 = keys
        .iter()
        .map(|k| match (a.get(*k), b.get(*k)) {
            (Some(x), Some(y)) => value_similarity(x, y),
            _ => 0.0,
        })
        .sum();
    total / keys.len() as f64
}

pub fn pair_similarity(a: &AgentResult, b: &AgentResult, measure: AgreementMeasure) -> f64 {
    match measure {
        AgreementMeasure::ConfidenceDistance => {
            1.0 - (a.effective_confidence() - b.effective_confidence()).abs()
        }
        AgreementMeasure::PayloadSimilarity => payload_similarity(&a.payload, &b.payload),
    }
}

/// Fraction of agent pairs whose similarity exceeds `threshold`.
///
/// Fewer than two agents trivially agree (1.0).
pub fn agreement_score(agents: &[&AgentResult], threshold: f64, measure: AgreementMeasure) -> f64 {
    if agents.len() < 2 {
        return 1.0;
    }
    let mut pairs = 0usize;
    let mut agreeing = 0usize;
    for (i, a) in agents.iter().enumerate() {
        for b in &agents[i + 1..] {
            pairs += 1;
            if pair_similarity(a, b, measure) > threshold {
                agreeing += 1;
            }
        }
    }
    agreeing as f64 / pairs as f64
}
