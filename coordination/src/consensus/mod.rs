//! Consensus aggregator for parallel agent outputs.
//!
//! Merges N [`AgentResult`]s into one [`ConsensusResult`] with a
//! caller-selected algorithm:
//!
//! ```text
//! results ──partition──► successful ─┬─ weights (algorithm) ──► merge payloads
//!                        failed      │                            │
//!                          │         └─ confidence, agreement ────┤
//!                          └──────────────────────────────────────┴─► ConsensusResult
//! ```
//!
//! | algorithm               | agent weight                               | confidence                    |
//! |-------------------------|--------------------------------------------|-------------------------------|
//! | `WeightedVoting`        | confidence × specialization relevance      | relevance-weighted mean       |
//! | `ConfidenceAggregation` | confidence                                 | mean confidence               |
//! | `PeerValidation`        | mean payload similarity to the other agents | peer-weighted mean confidence |
//! | `Hybrid`                | mean of the three weightings               | mean of the three confidences |
//!
//! With zero successful agents the result carries no value, confidence 0,
//! agreement 0 and `metadata.error`. Nothing is synthesised.

pub mod agreement;
pub mod merge;
pub mod types;
pub mod weighting;

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::events::{RaceEvent, SharedEventBus};

pub use agreement::AgreementMeasure;
pub use types::{
    AgentResult, AgentStatus, ConsensusAlgorithm, ConsensusMetadata, ConsensusResult,
    UnknownAlgorithm,
};
pub use weighting::{RelevanceTable, Weights};

/// Aggregator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Algorithm used by [`Aggregator::aggregate_default`].
    pub algorithm: ConsensusAlgorithm,
    /// Pairs more similar than this count as agreeing.
    pub agreement_threshold: f64,
    pub agreement_measure: AgreementMeasure,
    pub relevance: RelevanceTable,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            algorithm: ConsensusAlgorithm::Hybrid,
            agreement_threshold: 0.8,
            agreement_measure: AgreementMeasure::ConfidenceDistance,
            relevance: RelevanceTable::default(),
        }
    }
}

impl ConsensusConfig {
    pub fn with_algorithm(mut self, algorithm: ConsensusAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.agreement_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_measure(mut self, measure: AgreementMeasure) -> Self {
        self.agreement_measure = measure;
        self
    }

    pub fn with_relevance(mut self, relevance: RelevanceTable) -> Self {
        self.relevance = relevance;
        self
    }
}

pub struct Aggregator {
    config: ConsensusConfig,
    events: Option<SharedEventBus>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(ConsensusConfig::default())
    }
}

impl Aggregator {
    pub fn new(config: ConsensusConfig) -> Self {
        Self {
            config,
            events: None,
        }
    }

    pub fn with_event_bus(mut self, bus: SharedEventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn aggregate_default(&self, results: &BTreeMap<String, AgentResult>) -> ConsensusResult {
        self.aggregate(results, self.config.algorithm)
    }

    /// Merge `results` (keyed by agent id) with `algorithm`.
    pub fn aggregate(
        &self,
        results: &BTreeMap<String, AgentResult>,
        algorithm: ConsensusAlgorithm,
    ) -> ConsensusResult {
        let mut successful_ids = Vec::new();
        let mut successful = Vec::new();
        let mut failed_agents = Vec::new();
        let mut failure_reasons = BTreeMap::new();

        for (id, result) in results {
            if result.is_success() {
                successful_ids.push(id.clone());
                successful.push(result);
            } else {
                failed_agents.push(id.clone());
                failure_reasons.insert(id.clone(), result.failure_reason());
            }
        }

        if successful.is_empty() {
            let error = if results.is_empty() {
                "no agent results supplied".to_string()
            } else {
                format!("all {} agents failed; no consensus formed", results.len())
            };
            warn!(%algorithm, failed = failed_agents.len(), "Consensus aggregation failed");
            let result = ConsensusResult {
                consensus_value: None,
                confidence: 0.0,
                agreement_score: 0.0,
                participating_agents: Vec::new(),
                failed_agents: failed_agents.clone(),
                algorithm_used: algorithm,
                metadata: ConsensusMetadata {
                    successful_agents: Vec::new(),
                    failed_agents,
                    failure_reasons,
                    weights: BTreeMap::new(),
                    fallback: None,
                    error: Some(error),
                    component_confidences: BTreeMap::new(),
                    computed_at: Utc::now(),
                },
            };
            self.publish(&result);
            return result;
        }

        let table = &self.config.relevance;
        let mut component_confidences = BTreeMap::new();
        let (weights, confidence) = match algorithm {
            ConsensusAlgorithm::WeightedVoting => {
                let w = weighting::weighted_voting(&successful, table);
                (w, relevance_weighted_confidence(&successful, table))
            }
            ConsensusAlgorithm::ConfidenceAggregation => {
                let w = weighting::confidence_aggregation(&successful);
                (w, mean_confidence(&successful))
            }
            ConsensusAlgorithm::PeerValidation => {
                let w = weighting::peer_validation(&successful);
                let c = weighted_confidence(&successful, &w.values);
                (w, c)
            }
            ConsensusAlgorithm::Hybrid => {
                let peer = weighting::peer_validation(&successful);
                let parts = [
                    (
                        ConsensusAlgorithm::WeightedVoting,
                        relevance_weighted_confidence(&successful, table),
                    ),
                    (
                        ConsensusAlgorithm::ConfidenceAggregation,
                        mean_confidence(&successful),
                    ),
                    (
                        ConsensusAlgorithm::PeerValidation,
                        weighted_confidence(&successful, &peer.values),
                    ),
                ];
                for (name, c) in parts {
                    component_confidences.insert(name.to_string(), c);
                }
                let c = parts.iter().map(|(_, c)| c).sum::<f64>() / parts.len() as f64;
                (weighting::hybrid(&successful, table), c)
            }
        };

        let merged = merge::merge_payloads(&successful, &weights.values);
        let agreement_score = agreement::agreement_score(
            &successful,
            self.config.agreement_threshold,
            self.config.agreement_measure,
        );

        let weight_map: BTreeMap<String, f64> = successful_ids
            .iter()
            .cloned()
            .zip(weights.values.iter().copied())
            .collect();

        let result = ConsensusResult {
            consensus_value: Some(Value::Object(merged)),
            confidence: unit(confidence),
            agreement_score: unit(agreement_score),
            participating_agents: successful_ids.clone(),
            failed_agents: failed_agents.clone(),
            algorithm_used: algorithm,
            metadata: ConsensusMetadata {
                successful_agents: successful_ids,
                failed_agents,
                failure_reasons,
                weights: weight_map,
                fallback: weights.fallback,
                error: None,
                component_confidences,
                computed_at: Utc::now(),
            },
        };

        info!(
            %algorithm,
            participating = result.participating_agents.len(),
            failed = result.failed_agents.len(),
            confidence = result.confidence,
            agreement = result.agreement_score,
            "Consensus computed"
        );
        self.publish(&result);
        result
    }

    fn publish(&self, result: &ConsensusResult) {
        if let Some(bus) = &self.events {
            bus.publish(RaceEvent::ConsensusComputed {
                algorithm: result.algorithm_used,
                participating: result.participating_agents.len(),
                failed: result.failed_agents.len(),
                confidence: result.confidence,
                timestamp: Utc::now(),
            });
        }
    }
}

fn unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn mean_confidence(agents: &[&AgentResult]) -> f64 {
    agents.iter().map(|a| a.effective_confidence()).sum::<f64>() / agents.len() as f64
}

fn weighted_confidence(agents: &[&AgentResult], weights: &[f64]) -> f64 {
    agents
        .iter()
        .zip(weights)
        .map(|(a, w)| a.effective_confidence() * w)
        .sum()
}

fn relevance_weighted_confidence(agents: &[&AgentResult], table: &RelevanceTable) -> f64 {
    let relevance: Vec<f64> = agents
        .iter()
        .map(|a| table.relevance(&a.specialization))
        .collect();
    let total: f64 = relevance.iter().sum();
    if total <= 0.0 {
        return mean_confidence(agents);
    }
    weighted_confidence(agents, &relevance) / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn agent(id: &str, spec: &str, confidence: f64, payload: Value) -> AgentResult {
        let map: Map<String, Value> = payload.as_object().cloned().unwrap_or_default();
        AgentResult::new(id, spec, confidence, map)
    }

    fn inputs(agents: Vec<AgentResult>) -> BTreeMap<String, AgentResult> {
        agents.into_iter().map(|a| (a.agent_id.clone(), a)).collect()
    }

    #[test]
    fn test_confidence_aggregation_scenario() {
        let results = inputs(vec![
            agent("a", "analysis", 0.9, json!({"label": "X"})),
            agent("b", "analysis", 0.1, json!({"label": "X"})),
            agent("c", "analysis", 0.0, json!({"label": "Y"})),
        ]);
        let consensus =
            Aggregator::default().aggregate(&results, ConsensusAlgorithm::ConfidenceAggregation);

        assert_eq!(consensus.field("label"), Some(&json!("X")));
        assert!((consensus.confidence - 1.0 / 3.0).abs() < 1e-9);
        assert!((consensus.agreement_score - 1.0 / 3.0).abs() < 1e-9);
        assert!(consensus.metadata.fallback.is_none());
    }

    #[test]
    fn test_zero_confidence_falls_back_to_majority() {
        let results = inputs(vec![
            agent("a", "analysis", 0.0, json!({"label": "X"})),
            agent("b", "analysis", 0.0, json!({"label": "X"})),
            agent("c", "analysis", 0.0, json!({"label": "Y"})),
        ]);
        let consensus =
            Aggregator::default().aggregate(&results, ConsensusAlgorithm::ConfidenceAggregation);
        assert_eq!(consensus.field("label"), Some(&json!("X")));
        assert_eq!(consensus.confidence, 0.0);
        assert!(consensus.metadata.fallback.is_some());
    }

    #[test]
    fn test_all_failed_never_fabricates() {
        let results = inputs(vec![
            AgentResult::failed("a", "solver", "crashed"),
            AgentResult::timed_out("b", "solver"),
        ]);
        for &algorithm in ConsensusAlgorithm::all() {
            let consensus = Aggregator::default().aggregate(&results, algorithm);
            assert!(consensus.is_failure());
            assert_eq!(consensus.confidence, 0.0);
            assert_eq!(consensus.agreement_score, 0.0);
            assert_eq!(consensus.failed_agents, vec!["a", "b"]);
            assert!(consensus.metadata.error.is_some());
            assert_eq!(consensus.metadata.failure_reasons["a"], "crashed");
        }
    }

    #[test]
    fn test_empty_input_is_failure() {
        let consensus = Aggregator::default().aggregate_default(&BTreeMap::new());
        assert!(consensus.is_failure());
        assert_eq!(
            consensus.metadata.error.as_deref(),
            Some("no agent results supplied")
        );
    }

    #[test]
    fn test_partial_failure_aggregates_successful_subset() {
        let results = inputs(vec![
            agent("a", "solver", 0.8, json!({"cost": 10.0})),
            AgentResult::failed("b", "solver", "timeout talking to backend"),
            agent("c", "solver", 0.8, json!({"cost": 20.0})),
        ]);
        let consensus = Aggregator::default().aggregate(&results, ConsensusAlgorithm::WeightedVoting);
        assert_eq!(consensus.participating_agents, vec!["a", "c"]);
        assert_eq!(consensus.metadata.successful_agents, vec!["a", "c"]);
        assert_eq!(consensus.metadata.failed_agents, vec!["b"]);
        assert_eq!(consensus.field("cost").and_then(Value::as_f64), Some(15.0));
    }

    #[test]
    fn test_weighted_voting_prefers_relevant_specialization() {
        let results = inputs(vec![
            agent("a", "solver", 0.5, json!({"cost": 100.0})),
            agent("b", "explanation", 0.5, json!({"cost": 200.0})),
        ]);
        let consensus = Aggregator::default().aggregate(&results, ConsensusAlgorithm::WeightedVoting);
        // weights 0.6 / 0.4
        let cost = consensus.field("cost").and_then(Value::as_f64).unwrap();
        assert!((cost - 140.0).abs() < 1e-9);
        assert!((consensus.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_hybrid_records_components() {
        let results = inputs(vec![
            agent("a", "solver", 0.9, json!({"label": "X"})),
            agent("b", "data_analysis", 0.6, json!({"label": "X"})),
        ]);
        let consensus = Aggregator::default().aggregate(&results, ConsensusAlgorithm::Hybrid);
        assert_eq!(consensus.metadata.component_confidences.len(), 3);
        assert_eq!(consensus.field("label"), Some(&json!("X")));
        let weight_sum: f64 = consensus.metadata.weights.values().sum();
        assert!((weight_sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_confidence_scales_weight() {
        let results = inputs(vec![
            agent("a", "analysis", 0.9, json!({"label": "X"})).with_parse_confidence(0.1),
            agent("b", "analysis", 0.5, json!({"label": "Y"})),
        ]);
        let consensus =
            Aggregator::default().aggregate(&results, ConsensusAlgorithm::ConfidenceAggregation);
        assert_eq!(consensus.field("label"), Some(&json!("Y")));
    }

    #[tokio::test]
    async fn test_publishes_event() {
        let bus = crate::events::EventBus::new().shared();
        let mut rx = bus.subscribe();
        let aggregator = Aggregator::default().with_event_bus(bus);
        aggregator.aggregate_default(&inputs(vec![agent("a", "solver", 1.0, json!({}))]));
        assert_eq!(rx.recv().await.unwrap().event_type(), "consensus_computed");
    }
}
