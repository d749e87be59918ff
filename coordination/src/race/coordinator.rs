//! Race coordinator: JoinSet fan-out/fan-in under deadlines.
//!
//! ```text
//! run_race(model, config)
//!   → validate config, take admission permit       (Overloaded / ShuttingDown)
//!   → matcher.rank()                               (CapabilityMismatch, nothing spawned)
//!   → ResourceMonitor::start()
//!   → JoinSet::spawn(run_adapter) × top_k
//!        each task: acquire race slot, then global slot (bounded by race deadline)
//!                   timeout_at(min(race deadline, start + per-adapter limit), solve)
//!   → loop select! { biased; watchdog(race deadline) | join_next }
//!        watchdog fires → cancel tokens, abort_all, outstanding → TIMEOUT
//!   → monitor.stop(), record history, select winner
//! ```
//!
//! ## Partial failure policy
//!
//! An adapter error, panic or timeout becomes a `SolveResult` for that
//! adapter only. Siblings keep running. Results that land after the race
//! deadline are never collected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{AcquireError, Semaphore, TryAcquireError};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::result::SolveResult;
use super::selector::{self, Decision, Selection};
use super::{RaceError, RaceResult, RaceState};
use crate::backend::{AdapterError, AdapterRegistry, SharedAdapter, SolveContext};
use crate::config::{CoordinatorConfig, SolveConfig};
use crate::events::{RaceEvent, SharedEventBus};
use crate::history::{PerformanceKey, SharedPerformanceStore};
use crate::matcher::CapabilityMatcher;
use crate::monitor::{
    MonitorError, MonitorHandle, ProcessSampler, ResourceMonitor, ResourceSampler,
    ResourceSummary,
};
use crate::problem::{ProblemModel, ProblemType, SizeClass};

/// Fallback horizon for deadlines that would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Builds the sampler for each race's resource monitor.
pub type SamplerFactory =
    Arc<dyn Fn() -> Result<Box<dyn ResourceSampler>, MonitorError> + Send + Sync>;

pub type SharedRaceCoordinator = Arc<RaceCoordinator>;

/// Everything a finished race produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceOutcome {
    pub race_id: Uuid,
    pub state: RaceState,
    pub problem_type: ProblemType,
    pub size_class: SizeClass,
    pub selection: Selection,
    /// One result per launched adapter, in registration order.
    pub results: Vec<SolveResult>,
    pub resources: ResourceSummary,
    pub elapsed_ms: u64,
}

impl RaceOutcome {
    pub fn decision(&self) -> Option<&Decision> {
        self.selection.decision()
    }

    /// `(selection, results, resources)`.
    pub fn into_parts(self) -> (Selection, Vec<SolveResult>, ResourceSummary) {
        (self.selection, self.results, self.resources)
    }
}

pub struct RaceCoordinator {
    registry: AdapterRegistry,
    matcher: CapabilityMatcher,
    store: SharedPerformanceStore,
    config: CoordinatorConfig,
    adapter_slots: Arc<Semaphore>,
    admission: Arc<Semaphore>,
    accepting: AtomicBool,
    events: Option<SharedEventBus>,
    sampler_factory: SamplerFactory,
}

struct AdapterTask {
    adapter: SharedAdapter,
    model: Arc<ProblemModel>,
    config: Arc<SolveConfig>,
    global_slots: Arc<Semaphore>,
    race_slots: Arc<Semaphore>,
    race_deadline: Instant,
    cancel: CancellationToken,
}

impl RaceCoordinator {
    pub fn new(
        registry: AdapterRegistry,
        store: SharedPerformanceStore,
        config: CoordinatorConfig,
    ) -> RaceResult<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            matcher: CapabilityMatcher::new(store.clone()),
            store,
            adapter_slots: Arc::new(Semaphore::new(config.global_max_concurrent_adapters)),
            admission: Arc::new(Semaphore::new(config.max_inflight_races)),
            config,
            accepting: AtomicBool::new(true),
            events: None,
            sampler_factory: Arc::new(|| {
                ProcessSampler::current().map(|s| Box::new(s) as Box<dyn ResourceSampler>)
            }),
        })
    }

    pub fn with_event_bus(mut self, bus: SharedEventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn with_sampler_factory(mut self, factory: SamplerFactory) -> Self {
        self.sampler_factory = factory;
        self
    }

    pub fn shared(self) -> SharedRaceCoordinator {
        Arc::new(self)
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn history(&self) -> &SharedPerformanceStore {
        &self.store
    }

    /// Adapter slots currently free across all races.
    pub fn available_adapter_slots(&self) -> usize {
        self.adapter_slots.available_permits()
    }

    /// Races currently admitted.
    pub fn inflight_races(&self) -> usize {
        self.config.max_inflight_races - self.admission.available_permits()
    }

    /// Stop admitting races. Races already running finish normally.
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            self.admission.close();
            info!(inflight = self.inflight_races(), "Race coordinator shutting down");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        !self.accepting.load(Ordering::SeqCst)
    }

    pub async fn run_race(&self, model: ProblemModel, config: SolveConfig) -> RaceResult<RaceOutcome> {
        self.run_race_shared(Arc::new(model), config).await
    }

    /// Race the top-ranked adapters against `model`.
    ///
    /// Returns `Err` only for pre-race failures; every per-adapter failure
    /// is reported inside the outcome.
    pub async fn run_race_shared(
        &self,
        model: Arc<ProblemModel>,
        config: SolveConfig,
    ) -> RaceResult<RaceOutcome> {
        if self.is_shutting_down() {
            return Err(RaceError::ShuttingDown);
        }
        config.validate()?;

        let _admission = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(RaceError::ShuttingDown),
            Err(TryAcquireError::NoPermits) => {
                return Err(RaceError::Overloaded {
                    limit: self.config.max_inflight_races,
                })
            }
        };

        let problem_type = model.problem_type();
        let size_class = model.size_class();
        let candidates = self
            .matcher
            .rank_for(&self.registry, problem_type, size_class, &config)?;

        let race_id = Uuid::new_v4();
        let mut state = RaceState::Pending;
        debug!(%race_id, %state, problem = %model.name, "Race admitted");

        let started = Instant::now();
        let race_deadline = deadline_after(started, config.time_limit());
        let monitor = self.start_monitor(&config);
        let race_cancel = CancellationToken::new();
        let config = Arc::new(config);

        let mut tasks: JoinSet<SolveResult> = JoinSet::new();
        let mut slot_of: HashMap<tokio::task::Id, usize> = HashMap::new();
        let race_slots = Arc::new(Semaphore::new(config.max_concurrent_adapters));

        // Launch in rank order so the best candidates queue first for slots.
        for (slot, candidate) in candidates.iter().enumerate() {
            let task = AdapterTask {
                adapter: candidate.adapter.adapter.clone(),
                model: model.clone(),
                config: config.clone(),
                global_slots: self.adapter_slots.clone(),
                race_slots: race_slots.clone(),
                race_deadline,
                cancel: race_cancel.child_token(),
            };
            let handle = tasks.spawn(run_adapter(task));
            slot_of.insert(handle.id(), slot);
        }

        state = RaceState::Running;
        let ids: Vec<String> = candidates.iter().map(|c| c.adapter.id().to_string()).collect();
        info!(
            %race_id,
            %state,
            %problem_type,
            %size_class,
            candidates = ?ids,
            time_limit_ms = config.time_limit_ms,
            "Race started"
        );
        self.publish(RaceEvent::RaceStarted {
            race_id,
            problem_type,
            size_class,
            candidates: ids.clone(),
            timestamp: Utc::now(),
        });

        let mut collected: Vec<Option<SolveResult>> = vec![None; candidates.len()];
        let watchdog = tokio::time::sleep_until(race_deadline);
        tokio::pin!(watchdog);
        let mut deadline_hit = false;

        loop {
            tokio::select! {
                biased;
                _ = &mut watchdog => {
                    deadline_hit = true;
                    break;
                }
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    let (task_id, result) = match joined {
                        Ok((task_id, result)) => (task_id, result),
                        Err(e) => {
                            let task_id = e.id();
                            let Some(&slot) = slot_of.get(&task_id) else { continue };
                            warn!(%race_id, solver_id = %ids[slot], error = %e, "Adapter task panicked");
                            (task_id, SolveResult::error(ids[slot].clone(), format!("adapter task failed: {e}")))
                        }
                    };
                    let Some(&slot) = slot_of.get(&task_id) else { continue };
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    info!(
                        %race_id,
                        solver_id = %result.solver_id,
                        status = %result.status,
                        elapsed_ms,
                        "Adapter finished"
                    );
                    self.publish(RaceEvent::AdapterFinished {
                        race_id,
                        solver_id: result.solver_id.clone(),
                        status: result.status,
                        elapsed_ms,
                        timestamp: Utc::now(),
                    });
                    collected[slot] = Some(result);
                }
            }
        }

        if deadline_hit {
            race_cancel.cancel();
            tasks.abort_all();
        }
        drop(tasks);

        let race_elapsed = started.elapsed();
        let mut cancelled = 0usize;
        let mut results: Vec<(usize, SolveResult)> = Vec::with_capacity(candidates.len());
        for ((slot, candidate), result) in candidates.iter().enumerate().zip(collected) {
            let result = match result {
                Some(result) => result,
                None => {
                    cancelled += 1;
                    warn!(%race_id, solver_id = %ids[slot], "Adapter cancelled at race deadline");
                    self.publish(RaceEvent::AdapterCancelled {
                        race_id,
                        solver_id: ids[slot].clone(),
                        timestamp: Utc::now(),
                    });
                    SolveResult::timeout(ids[slot].clone(), "cancelled at race deadline")
                        .with_solve_time(race_elapsed)
                }
            };
            results.push((candidate.adapter.index, result));
        }
        results.sort_by_key(|(index, _)| *index);
        let results: Vec<SolveResult> = results.into_iter().map(|(_, r)| r).collect();

        state = if cancelled > 0 {
            RaceState::TimedOut
        } else {
            RaceState::Completed
        };

        let resources = match monitor {
            Ok(handle) => handle.stop().await,
            Err(reason) => ResourceSummary::unavailable(reason),
        };

        for result in &results {
            let success = selector::priority(result, &config).is_some()
                && selector::validate(result, &model, &config).is_ok();
            self.store.record_outcome(
                PerformanceKey::new(result.solver_id.clone(), problem_type, size_class),
                success,
                result.solve_time,
            );
        }

        let selection = selector::select(&results, &model, &config);
        let elapsed_ms = race_elapsed.as_millis() as u64;
        info!(
            %race_id,
            %state,
            winner = selection.winner_id().unwrap_or("none"),
            cancelled,
            elapsed_ms,
            "Race finished"
        );
        self.publish(RaceEvent::RaceFinished {
            race_id,
            state,
            winner: selection.winner_id().map(str::to_string),
            elapsed_ms,
            timestamp: Utc::now(),
        });

        Ok(RaceOutcome {
            race_id,
            state,
            problem_type,
            size_class,
            selection,
            results,
            resources,
            elapsed_ms,
        })
    }

    fn start_monitor(&self, config: &SolveConfig) -> Result<MonitorHandle, String> {
        match (self.sampler_factory)() {
            Ok(sampler) => Ok(ResourceMonitor::start(
                sampler,
                config.monitor_interval(),
                config.memory_limit_mb,
            )),
            Err(e) => {
                warn!(error = %e, "Resource monitor unavailable for this race");
                Err(e.to_string())
            }
        }
    }

    fn publish(&self, event: RaceEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

async fn run_adapter(task: AdapterTask) -> SolveResult {
    let id = task.adapter.id().to_string();
    let queued = Instant::now();

    // Race slot first: a task queued behind its own race's cap holds no global slot.
    let permits = tokio::time::timeout_at(task.race_deadline, async {
        let local = task.race_slots.clone().acquire_owned().await?;
        let global = task.global_slots.clone().acquire_owned().await?;
        Ok::<_, AcquireError>((local, global))
    })
    .await;
    let _permits = match permits {
        Ok(Ok(permits)) => permits,
        Ok(Err(_)) => return SolveResult::error(id, "adapter slots closed"),
        Err(_) => {
            return SolveResult::timeout(id, "race deadline passed while waiting for a slot")
                .with_solve_time(queued.elapsed())
        }
    };

    let started = Instant::now();
    let deadline = task
        .race_deadline
        .min(deadline_after(started, task.config.per_adapter_time_limit()));
    let ctx = SolveContext::new(deadline, task.cancel.clone());
    debug!(solver_id = %id, remaining_ms = ctx.remaining().as_millis() as u64, "Adapter launched");

    let outcome =
        tokio::time::timeout_at(deadline, task.adapter.solve(task.model, &task.config, ctx)).await;
    let elapsed = started.elapsed();

    match outcome {
        Ok(Ok(mut result)) => {
            if result.solver_id != id {
                debug!(solver_id = %id, reported = %result.solver_id, "Adapter reported a different id");
                result.solver_id = id;
            }
            if result.solve_time.is_zero() {
                result.solve_time = elapsed;
            }
            result
        }
        Ok(Err(AdapterError::Cancelled)) => {
            SolveResult::timeout(id, "adapter observed cancellation").with_solve_time(elapsed)
        }
        Ok(Err(e)) => SolveResult::error(id, e.to_string()).with_solve_time(elapsed),
        Err(_) => {
            task.cancel.cancel();
            SolveResult::timeout(
                id,
                format!(
                    "exceeded adapter deadline of {}ms",
                    task.config.per_adapter_time_limit_ms
                ),
            )
            .with_solve_time(elapsed)
        }
    }
}

fn deadline_after(start: Instant, limit: Duration) -> Instant {
    start
        .checked_add(limit)
        .unwrap_or_else(|| start + FAR_FUTURE)
}
