//! Capability matcher: picks the top-K adapters for a problem.
//!
//! ```text
//! ProblemModel ──► (problem_type, size_class)
//!                       │
//!   registry ──filter: profile.supports(type, size)──► eligible
//!                       │
//!   score = base_score + bonus(type, size) + f(history)
//!   f     = 2·success_rate + max(0, (T_max − avg_time) / T_max)
//!                       │
//!   sort desc (ties: registration order) ──► take(top_k)
//! ```
//!
//! `T_max` is the per-adapter time limit of the race being planned. An
//! adapter with no recorded runs gets [`NEUTRAL_HISTORY_SCORE`], the value a
//! 50% success rate at half the time budget would earn.

use std::time::Duration;

use tracing::debug;

use crate::backend::{AdapterRegistry, RegisteredAdapter};
use crate::config::SolveConfig;
use crate::history::{PerformanceKey, PerformanceRecord, SharedPerformanceStore};
use crate::problem::{ProblemModel, ProblemType, SizeClass};
use crate::race::RaceError;

pub const NEUTRAL_HISTORY_SCORE: f64 = 1.5;

/// An eligible adapter with its ranking score.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub adapter: RegisteredAdapter,
    pub score: f64,
    pub history: Option<PerformanceRecord>,
}

/// History component of the ranking score.
pub fn history_score(record: Option<&PerformanceRecord>, t_max: Duration) -> f64 {
    let Some(record) = record.filter(|r| r.run_count > 0) else {
        return NEUTRAL_HISTORY_SCORE;
    };
    let t_max = t_max.as_secs_f64();
    let speed = match record.avg_time() {
        Some(avg) if t_max > 0.0 => ((t_max - avg.as_secs_f64()) / t_max).max(0.0),
        _ => 0.0,
    };
    2.0 * record.success_rate() + speed
}

pub struct CapabilityMatcher {
    store: SharedPerformanceStore,
}

impl CapabilityMatcher {
    pub fn new(store: SharedPerformanceStore) -> Self {
        Self { store }
    }

    /// Rank eligible adapters for `model`; fails fast if none qualify.
    pub fn rank(
        &self,
        registry: &AdapterRegistry,
        model: &ProblemModel,
        config: &SolveConfig,
    ) -> Result<Vec<RankedCandidate>, RaceError> {
        let problem_type = model.problem_type();
        let size_class = model.size_class();
        self.rank_for(registry, problem_type, size_class, config)
    }

    pub fn rank_for(
        &self,
        registry: &AdapterRegistry,
        problem_type: ProblemType,
        size_class: SizeClass,
        config: &SolveConfig,
    ) -> Result<Vec<RankedCandidate>, RaceError> {
        let t_max = config.per_adapter_time_limit();

        let mut ranked: Vec<RankedCandidate> = registry
            .iter()
            .filter(|entry| entry.adapter.capabilities().supports(problem_type, size_class))
            .map(|entry| {
                let profile = entry.adapter.capabilities();
                let key = PerformanceKey::new(entry.id(), problem_type, size_class);
                let history = self.store.lookup(&key);
                let score = profile.base_score
                    + profile.bonus(problem_type, size_class)
                    + history_score(history.as_ref(), t_max);
                RankedCandidate {
                    adapter: entry.clone(),
                    score,
                    history,
                }
            })
            .collect();

        if ranked.is_empty() {
            return Err(RaceError::CapabilityMismatch {
                problem_type,
                size_class,
            });
        }

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.adapter.index.cmp(&b.adapter.index))
        });
        ranked.truncate(config.top_k);

        debug!(
            %problem_type,
            %size_class,
            candidates = ?ranked.iter().map(|c| (c.adapter.id(), c.score)).collect::<Vec<_>>(),
            "Ranked candidate backends"
        );
        Ok(ranked)
    }
}
