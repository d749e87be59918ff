//! Per-algorithm agent weights.
//!
//! Each function returns weights aligned with its input slice and summing
//! to 1. When every raw weight is zero the result falls back to equal
//! weights, which turns weighted merging into a plain majority / mean.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::agreement::payload_similarity;
use super::types::AgentResult;

/// Weight for specializations missing from the relevance table.
pub const NEUTRAL_RELEVANCE: f64 = 1.0;

/// Static specialization → relevance multipliers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelevanceTable(BTreeMap<String, f64>);

impl Default for RelevanceTable {
    fn default() -> Self {
        Self(
            [
                ("solver", 1.2),
                ("model_building", 1.1),
                ("data_analysis", 1.0),
                ("intent_classification", 0.9),
                ("explanation", 0.8),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        )
    }
}

impl RelevanceTable {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, specialization: impl Into<String>, relevance: f64) -> Self {
        self.0.insert(specialization.into(), relevance.max(0.0));
        self
    }

    pub fn relevance(&self, specialization: &str) -> f64 {
        self.0
            .get(specialization)
            .copied()
            .unwrap_or(NEUTRAL_RELEVANCE)
    }
}

/// Normalised weights plus the fallback note, if one was taken.
#[derive(Debug, Clone, PartialEq)]
pub struct Weights {
    pub values: Vec<f64>,
    pub fallback: Option<String>,
}

impl Weights {
    /// Normalise `raw`; all-zero (or non-finite) input yields equal weights.
    pub fn normalize(raw: Vec<f64>, fallback_note: &str) -> Self {
        let n = raw.len();
        let total: f64 = raw.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
        if n == 0 {
            return Self {
                values: raw,
                fallback: None,
            };
        }
        if total <= 0.0 {
            return Self {
                values: vec![1.0 / n as f64; n],
                fallback: Some(fallback_note.to_string()),
            };
        }
        let values = raw
            .into_iter()
            .map(|w| if w.is_finite() && w > 0.0 { w / total } else { 0.0 })
            .collect();
        Self {
            values,
            fallback: None,
        }
    }
}

pub fn weighted_voting(agents: &[&AgentResult], table: &RelevanceTable) -> Weights {
    let raw = agents
        .iter()
        .map(|a| a.effective_confidence() * table.relevance(&a.specialization))
        .collect();
    Weights::normalize(raw, "all confidence x relevance products are zero; equal weights")
}

pub fn confidence_aggregation(agents: &[&AgentResult]) -> Weights {
    let raw = agents.iter().map(|a| a.effective_confidence()).collect();
    Weights::normalize(raw, "total confidence is zero; unweighted majority/average")
}

/// Each agent weighted by its mean payload similarity to every other agent.
pub fn peer_validation(agents: &[&AgentResult]) -> Weights {
    if agents.len() == 1 {
        return Weights {
            values: vec![1.0],
            fallback: None,
        };
    }
    let others = (agents.len() - 1) as f64;
    let raw = agents
        .iter()
        .enumerate()
        .map(|(i, a)| {
            agents
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, b)| payload_similarity(&a.payload, &b.payload))
                .sum::<f64>()
                / others
        })
        .collect();
    Weights::normalize(raw, "no agent resembles any peer; equal weights")
}

/// Equal-weighted mean of the three component weightings.
pub fn hybrid(agents: &[&AgentResult], table: &RelevanceTable) -> Weights {
    let parts = [
        weighted_voting(agents, table),
        confidence_aggregation(agents),
        peer_validation(agents),
    ];
    let values = (0..agents.len())
        .map(|i| parts.iter().map(|p| p.values[i]).sum::<f64>() / parts.len() as f64)
        .collect();
    let notes: Vec<&str> = parts.iter().filter_map(|p| p.fallback.as_deref()).collect();
    Weights {
        values,
        fallback: (!notes.is_empty()).then(|| notes.join("; ")),
    }
}
