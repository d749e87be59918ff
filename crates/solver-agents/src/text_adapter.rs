//! Best-effort extraction of [`AgentResult`]s from free-text agent output.
//!
//! Sits in front of the aggregator, never inside it. Every extracted result
//! carries a `parse_confidence` so the aggregator can discount it; text with
//! nothing usable becomes an explicit failed result.
//!
//! Tried in order:
//! 1. A JSON object (fenced ```json block or the outermost `{...}`)
//! 2. Line patterns: `confidence: 0.8` / `80%`, categorical
//!    `recommendation: ...` style lines, `key: number` pairs, bullet lists

use std::sync::LazyLock;

use coordination::consensus::AgentResult;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use tracing::debug;

/// Parse confidence for a JSON object found in the text.
pub const JSON_PARSE_CONFIDENCE: f64 = 0.9;
/// Starting parse confidence for pattern extraction, before per-signal credit.
pub const PATTERN_BASE_CONFIDENCE: f64 = 0.2;
/// Credit per distinct signal kind found by pattern extraction.
pub const PATTERN_SIGNAL_CREDIT: f64 = 0.15;
/// Agent confidence assumed when the text states none.
pub const DEFAULT_AGENT_CONFIDENCE: f64 = 0.5;

static JSON_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("JSON_FENCE_RE regex should compile")
});

static CONFIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bconfidence\b\s*(?:level|score)?\s*[:=]?\s*(\d+(?:\.\d+)?)\s*(%)?")
        .expect("CONFIDENCE_RE regex should compile")
});

static CATEGORICAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^\s*(?:[-*]\s*)?(recommendation|answer|decision|label|intent|category|verdict)\s*[:=]\s*(.+?)\s*$",
    )
    .expect("CATEGORICAL_RE regex should compile")
});

static KEY_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:[-*]\s*)?([A-Za-z][A-Za-z0-9 _]{0,40}?)\s*[:=]\s*(-?\d+(?:\.\d+)?)\s*$")
        .expect("KEY_NUMBER_RE regex should compile")
});

static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:[-*•]|\d+[.)])\s+(.+?)\s*$").expect("BULLET_RE regex should compile")
});

/// How a result was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Json,
    Patterns,
    Nothing,
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub method: ExtractionMethod,
    pub result: AgentResult,
}

/// Turns agent prose into typed agent results.
#[derive(Debug, Clone, Default)]
pub struct TextAdapter {
    default_confidence: Option<f64>,
}

impl TextAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confidence used when the text does not state one.
    pub fn with_default_confidence(mut self, confidence: f64) -> Self {
        self.default_confidence = Some(confidence);
        self
    }

    pub fn extract(&self, agent_id: &str, specialization: &str, text: &str) -> Extraction {
        let fallback = self.default_confidence.unwrap_or(DEFAULT_AGENT_CONFIDENCE);

        if let Some(mut payload) = find_json_object(text) {
            let confidence = payload
                .remove("confidence")
                .and_then(|v| v.as_f64())
                .map(normalize_confidence)
                .or_else(|| stated_confidence(text))
                .unwrap_or(fallback);
            debug!(agent_id, fields = payload.len(), "Extracted JSON payload from agent text");
            return Extraction {
                method: ExtractionMethod::Json,
                result: AgentResult::new(agent_id, specialization, confidence, payload)
                    .with_parse_confidence(JSON_PARSE_CONFIDENCE),
            };
        }

        let (payload, signals) = scan_patterns(text);
        let confidence = stated_confidence(text);
        let signals = signals + usize::from(confidence.is_some());

        if payload.is_empty() {
            debug!(agent_id, "No structured content in agent text");
            return Extraction {
                method: ExtractionMethod::Nothing,
                result: AgentResult::failed(
                    agent_id,
                    specialization,
                    "no structured content found in agent text",
                ),
            };
        }

        let parse_confidence =
            (PATTERN_BASE_CONFIDENCE + PATTERN_SIGNAL_CREDIT * signals as f64).min(0.8);
        debug!(agent_id, signals, parse_confidence, "Extracted agent result by patterns");
        Extraction {
            method: ExtractionMethod::Patterns,
            result: AgentResult::new(
                agent_id,
                specialization,
                confidence.unwrap_or(fallback),
                payload,
            )
            .with_parse_confidence(parse_confidence),
        }
    }
}

/// Values above 1 are read as percentages.
fn normalize_confidence(value: f64) -> f64 {
    if value > 1.0 {
        value / 100.0
    } else {
        value
    }
}

fn stated_confidence(text: &str) -> Option<f64> {
    let caps = CONFIDENCE_RE.captures(text)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(if caps.get(2).is_some() {
        value / 100.0
    } else {
        normalize_confidence(value)
    })
}

fn find_json_object(text: &str) -> Option<Map<String, Value>> {
    let fenced = JSON_FENCE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str());
    let bare = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&text[start..=end]),
        _ => None,
    };
    [fenced, bare]
        .into_iter()
        .flatten()
        .find_map(|candidate| match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) if !map.is_empty() => Some(map),
            _ => None,
        })
}

fn snake_key(raw: &str) -> String {
    raw.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

/// Pattern scan; returns the payload and the number of signal kinds found.
fn scan_patterns(text: &str) -> (Map<String, Value>, usize) {
    let mut payload = Map::new();
    let mut signals = 0;
    let mut consumed: Vec<&str> = Vec::new();

    for caps in CATEGORICAL_RE.captures_iter(text) {
        let (Some(line), Some(key), Some(value)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let key = snake_key(key.as_str());
        payload
            .entry(key)
            .or_insert_with(|| Value::String(value.as_str().trim_end_matches('.').to_string()));
        consumed.push(line.as_str());
    }
    if !consumed.is_empty() {
        signals += 1;
    }

    let mut numbers = 0;
    for caps in KEY_NUMBER_RE.captures_iter(text) {
        let (Some(line), Some(key), Some(value)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let key = snake_key(key.as_str());
        if key == "confidence" || payload.contains_key(&key) {
            consumed.push(line.as_str());
            continue;
        }
        if let Some(n) = value.as_str().parse::<f64>().ok().and_then(Number::from_f64) {
            payload.insert(key, Value::Number(n));
            consumed.push(line.as_str());
            numbers += 1;
        }
    }
    if numbers > 0 {
        signals += 1;
    }

    let points: Vec<Value> = BULLET_RE
        .captures_iter(text)
        .filter(|caps| {
            caps.get(0)
                .map(|line| !consumed.contains(&line.as_str()))
                .unwrap_or(false)
        })
        .filter_map(|caps| caps.get(1))
        .map(|m| Value::String(m.as_str().to_string()))
        .collect();
    if !points.is_empty() {
        payload.insert("points".into(), Value::Array(points));
        signals += 1;
    }

    (payload, signals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination::consensus::AgentStatus;
    use serde_json::json;

    #[test]
    fn test_fenced_json_preferred() {
        let text = "Here is my analysis.\n```json\n{\"label\": \"X\", \"confidence\": 0.8, \"cost\": 12}\n```\nThanks";
        let extraction = TextAdapter::new().extract("a1", "data_analysis", text);
        assert_eq!(extraction.method, ExtractionMethod::Json);
        let result = extraction.result;
        assert_eq!(result.confidence, 0.8);
        assert_eq!(result.parse_confidence, Some(JSON_PARSE_CONFIDENCE));
        assert_eq!(result.payload["label"], json!("X"));
        assert!(!result.payload.contains_key("confidence"));
    }

    #[test]
    fn test_bare_json_object() {
        let text = r#"Result: {"plan": "overtime", "hours": 4}"#;
        let extraction = TextAdapter::new().extract("a1", "solver", text);
        assert_eq!(extraction.method, ExtractionMethod::Json);
        assert_eq!(extraction.result.confidence, DEFAULT_AGENT_CONFIDENCE);
        assert_eq!(extraction.result.payload["hours"], json!(4));
    }

    #[test]
    fn test_patterns() {
        let text = "Recommendation: Hire two contractors.\n\
                    Confidence: 85%\n\
                    total cost: 12000\n\
                    Risks:\n\
                    - budget overrun\n\
                    - onboarding delay\n";
        let extraction = TextAdapter::new().extract("a2", "explanation", text);
        assert_eq!(extraction.method, ExtractionMethod::Patterns);
        let result = extraction.result;
        assert!((result.confidence - 0.85).abs() < 1e-12);
        assert_eq!(result.payload["recommendation"], json!("Hire two contractors"));
        assert_eq!(result.payload["total_cost"], json!(12000.0));
        assert_eq!(
            result.payload["points"],
            json!(["budget overrun", "onboarding delay"])
        );
        // four signal kinds
        assert!((result.parse_confidence.unwrap() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_low_signal_text_gets_low_parse_confidence() {
        let extraction = TextAdapter::new().extract("a3", "explanation", "- only a bullet");
        let parse = extraction.result.parse_confidence.unwrap();
        assert!((parse - 0.35).abs() < 1e-12);
        assert!(extraction.result.effective_confidence() < DEFAULT_AGENT_CONFIDENCE);
    }

    #[test]
    fn test_nothing_usable_is_failed_result() {
        let extraction =
            TextAdapter::new().extract("a4", "solver", "I could not work this one out, sorry.");
        assert_eq!(extraction.method, ExtractionMethod::Nothing);
        assert_eq!(extraction.result.status, AgentStatus::Failed);
        assert!(extraction.result.payload.is_empty());
    }

    #[test]
    fn test_stated_confidence_forms() {
        assert_eq!(stated_confidence("confidence: 0.7"), Some(0.7));
        assert_eq!(stated_confidence("Confidence level = 70%"), Some(0.7));
        assert_eq!(stated_confidence("confidence 90"), Some(0.9));
        assert_eq!(stated_confidence("no number here"), None);
    }

    #[test]
    fn test_snake_key() {
        assert_eq!(snake_key("Total Cost"), "total_cost");
        assert_eq!(snake_key("max-hours"), "max_hours");
    }
}
