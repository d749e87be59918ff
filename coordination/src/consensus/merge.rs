//! Type-polymorphic, weight-aware payload merge.
//!
//! Applied per top-level field across the agents that carry it:
//!
//! | field kind        | rule                                                   |
//! |-------------------|--------------------------------------------------------|
//! | number            | weighted mean (weights renormalised over contributors) |
//! | string / bool     | weighted majority; ties → highest confidence, then first |
//! | array             | ordered union, heavier agents first                    |
//! | object            | deep overlay, heavier agent wins conflicting keys      |
//! | mixed kinds       | value of the heaviest contributor                      |
//!
//! `null` contributions are ignored.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use super::types::AgentResult;

/// One agent's value for a field.
#[derive(Debug, Clone, Copy)]
pub struct Contribution<'a> {
    /// Position in the input order.
    pub order: usize,
    pub weight: f64,
    pub confidence: f64,
    pub value: &'a Value,
}

/// Merge agent payloads using `weights` (aligned with `agents`).
pub fn merge_payloads(agents: &[&AgentResult], weights: &[f64]) -> Map<String, Value> {
    let mut keys: Vec<&String> = Vec::new();
    for agent in agents {
        for key in agent.payload.keys() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys.sort();

    keys.into_iter()
        .map(|key| {
            let contributions: Vec<Contribution<'_>> = agents
                .iter()
                .enumerate()
                .filter_map(|(order, agent)| {
                    agent.payload.get(key).map(|value| Contribution {
                        order,
                        weight: weights.get(order).copied().unwrap_or(0.0),
                        confidence: agent.effective_confidence(),
                        value,
                    })
                })
                .collect();
            (key.clone(), merge_field(&contributions))
        })
        .collect()
}

/// Merge the contributions for one field.
pub fn merge_field(contributions: &[Contribution<'_>]) -> Value {
    let present: Vec<Contribution<'_>> = contributions
        .iter()
        .copied()
        .filter(|c| !c.value.is_null())
        .collect();
    if present.is_empty() {
        return Value::Null;
    }

    let same_kind = |pred: fn(&Value) -> bool| present.iter().all(|c| pred(c.value));

    if same_kind(Value::is_number) {
        weighted_mean(&present).unwrap_or_else(|| heaviest(&present).clone())
    } else if same_kind(Value::is_string) || same_kind(Value::is_boolean) {
        majority(&present).clone()
    } else if same_kind(Value::is_array) {
        union(&present)
    } else if same_kind(Value::is_object) {
        overlay(&present)
    } else {
        heaviest(&present).clone()
    }
}

fn by_weight_desc(a: &Contribution<'_>, b: &Contribution<'_>) -> Ordering {
    b.weight
        .total_cmp(&a.weight)
        .then_with(|| a.order.cmp(&b.order))
}

fn heaviest<'a>(present: &[Contribution<'a>]) -> &'a Value {
    present
        .iter()
        .min_by(|a, b| by_weight_desc(a, b))
        .map(|c| c.value)
        .unwrap_or(&Value::Null)
}

fn weighted_mean(present: &[Contribution<'_>]) -> Option<Value> {
    let values: Vec<(f64, f64)> = present
        .iter()
        .filter_map(|c| c.value.as_f64().map(|v| (v, c.weight)))
        .collect();
    if values.is_empty() {
        return None;
    }
    let total: f64 = values.iter().map(|(_, w)| w).sum();
    let mean = if total > 0.0 {
        values.iter().map(|(v, w)| v * w).sum::<f64>() / total
    } else {
        values.iter().map(|(v, _)| v).sum::<f64>() / values.len() as f64
    };
    Number::from_f64(mean).map(Value::Number)
}

fn majority<'a>(present: &[Contribution<'a>]) -> &'a Value {
    // (value, tally, best contributor confidence, first order)
    let mut tallies: Vec<(&'a Value, f64, f64, usize)> = Vec::new();
    for c in present {
        match tallies.iter_mut().find(|(v, ..)| *v == c.value) {
            Some(entry) => {
                entry.1 += c.weight;
                entry.2 = entry.2.max(c.confidence);
                entry.3 = entry.3.min(c.order);
            }
            None => tallies.push((c.value, c.weight, c.confidence, c.order)),
        }
    }

    let top = tallies
        .iter()
        .map(|(_, tally, ..)| *tally)
        .fold(f64::NEG_INFINITY, f64::max);
    let tied: Vec<&(&'a Value, f64, f64, usize)> = tallies
        .iter()
        .filter(|(_, tally, ..)| (top - tally).abs() <= f64::EPSILON * top.abs().max(1.0))
        .collect();

    if top <= 0.0 {
        // No weighted majority at all: first non-empty value.
        return present
            .iter()
            .map(|c| c.value)
            .find(|v| !is_empty(v))
            .unwrap_or(present[0].value);
    }

    tied.into_iter()
        .max_by(|a, b| {
            a.2.total_cmp(&b.2)
                .then_with(|| is_empty(b.0).cmp(&is_empty(a.0)))
                .then_with(|| b.3.cmp(&a.3))
        })
        .map(|(v, ..)| *v)
        .unwrap_or(present[0].value)
}

fn is_empty(value: &Value) -> bool {
    matches!(value, Value::String(s) if s.trim().is_empty())
}

fn union(present: &[Contribution<'_>]) -> Value {
    let mut ordered = present.to_vec();
    ordered.sort_by(by_weight_desc);
    let mut items: Vec<Value> = Vec::new();
    for c in ordered {
        if let Value::Array(values) = c.value {
            for v in values {
                if !items.contains(v) {
                    items.push(v.clone());
                }
            }
        }
    }
    Value::Array(items)
}

fn overlay(present: &[Contribution<'_>]) -> Value {
    let mut ordered = present.to_vec();
    // Lightest first so heavier agents overwrite.
    ordered.sort_by(|a, b| by_weight_desc(b, a));
    let mut merged = Map::new();
    for c in ordered {
        if let Value::Object(map) = c.value {
            deep_overlay(&mut merged, map);
        }
    }
    Value::Object(merged)
}

fn deep_overlay(base: &mut Map<String, Value>, top: &Map<String, Value>) {
    for (key, value) in top {
        if value.is_null() {
            continue;
        }
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_overlay(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}
