//! Integration tests for the solver race
//!
//! Drives `RaceCoordinator` end to end with scripted in-process adapters on
//! a paused tokio clock: rank → launch → deadline → select → history.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coordination::backend::{
    AdapterError, AdapterRegistry, BackendAdapter, CapabilityProfile, SolveContext,
};
use coordination::config::{CoordinatorConfig, SolveConfig};
use coordination::events::{EventBus, RaceEvent};
use coordination::history::{
    InMemoryPerformanceStore, PerformanceKey, PerformanceStore, SharedPerformanceStore,
};
use coordination::monitor::{MonitorError, ResourceSample, ResourceSampler};
use coordination::problem::{
    Constraint, ConstraintSense, LinearExpr, Objective, ObjectiveSense, ProblemModel,
    ProblemType, SizeClass, Variable,
};
use coordination::race::{
    RaceCoordinator, RaceError, RaceState, SamplerFactory, Selection, SolveResult, SolveStatus,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// What a scripted adapter does once it holds a slot.
#[derive(Clone)]
enum Script {
    Solve { objective: f64, status: SolveStatus },
    Fail(&'static str),
    Panic,
}

struct ScriptedAdapter {
    id: String,
    caps: CapabilityProfile,
    delay: Duration,
    script: Script,
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    seen_cancel: Arc<Mutex<Option<CancellationToken>>>,
}

impl ScriptedAdapter {
    fn new(id: &str, delay_ms: u64, script: Script) -> Self {
        Self {
            id: id.to_string(),
            caps: CapabilityProfile::universal(),
            delay: Duration::from_millis(delay_ms),
            script,
            calls: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            seen_cancel: Arc::new(Mutex::new(None)),
        }
    }

    fn optimal(id: &str, delay_ms: u64, objective: f64) -> Self {
        Self::new(
            id,
            delay_ms,
            Script::Solve {
                objective,
                status: SolveStatus::Optimal,
            },
        )
    }

    fn with_caps(mut self, caps: CapabilityProfile) -> Self {
        self.caps = caps;
        self
    }

    fn sharing_gauges(mut self, running: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>) -> Self {
        self.running = running.clone();
        self.peak = peak.clone();
        self
    }
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &CapabilityProfile {
        &self.caps
    }

    async fn solve(
        &self,
        _model: Arc<ProblemModel>,
        _config: &SolveConfig,
        ctx: SolveContext,
    ) -> Result<SolveResult, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.seen_cancel.lock().unwrap() = Some(ctx.cancel.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        match &self.script {
            Script::Solve { objective, status } => Ok(SolveResult::solved(
                self.id.clone(),
                *status,
                *objective,
                [("x".to_string(), *objective)],
            )
            .with_solve_time(self.delay)),
            Script::Fail(reason) => Err(AdapterError::Execution(reason.to_string())),
            Script::Panic => panic!("backend crashed"),
        }
    }
}

struct FixedSampler;

impl ResourceSampler for FixedSampler {
    fn sample(&mut self) -> Result<ResourceSample, MonitorError> {
        Ok(ResourceSample {
            cpu_percent: 50.0,
            memory_bytes: 64 * 1024 * 1024,
        })
    }
}

fn fixed_sampler() -> SamplerFactory {
    Arc::new(|| Ok(Box::new(FixedSampler) as Box<dyn ResourceSampler>))
}

/// `min x  s.t.  x <= 200`, continuous and small.
fn linear_model() -> ProblemModel {
    ProblemModel::new(
        "integration",
        Objective {
            sense: ObjectiveSense::Minimize,
            expression: LinearExpr::new().term("x", 1.0),
        },
    )
    .with_variable(Variable::continuous("x"))
    .with_constraint(Constraint::new(
        LinearExpr::new().term("x", 1.0),
        ConstraintSense::LessEqual,
        200.0,
    ))
}

fn coordinator(adapters: Vec<ScriptedAdapter>, config: CoordinatorConfig) -> RaceCoordinator {
    coordinator_with_store(adapters, config, InMemoryPerformanceStore::new().shared())
}

fn coordinator_with_store(
    adapters: Vec<ScriptedAdapter>,
    config: CoordinatorConfig,
    store: SharedPerformanceStore,
) -> RaceCoordinator {
    let mut builder = AdapterRegistry::builder();
    for adapter in adapters {
        builder = builder.register(adapter).unwrap();
    }
    RaceCoordinator::new(builder.build(), store, config)
        .unwrap()
        .with_sampler_factory(fixed_sampler())
}

fn statuses(results: &[SolveResult]) -> Vec<(&str, SolveStatus)> {
    results
        .iter()
        .map(|r| (r.solver_id.as_str(), r.status))
        .collect()
}

/// Test: better objective beats faster runner-up, crashed backend is reported
#[tokio::test(start_paused = true)]
async fn test_three_backend_race_selects_best_score() {
    init_tracing();
    let coord = coordinator(
        vec![
            ScriptedAdapter::optimal("A", 2_000, 100.0),
            ScriptedAdapter::optimal("B", 5_000, 95.0),
            ScriptedAdapter::new("C", 10, Script::Fail("segfault")),
        ],
        CoordinatorConfig::default(),
    );

    let outcome = coord
        .run_race(linear_model(), SolveConfig::default().top_k(3))
        .await
        .unwrap();

    assert_eq!(outcome.state, RaceState::Completed);
    assert_eq!(outcome.problem_type, ProblemType::Linear);
    assert_eq!(outcome.size_class, SizeClass::Small);
    assert_eq!(
        statuses(&outcome.results),
        vec![
            ("A", SolveStatus::Optimal),
            ("B", SolveStatus::Optimal),
            ("C", SolveStatus::Error),
        ]
    );

    let decision = outcome.decision().expect("a winner");
    assert_eq!(decision.winner.solver_id, "B");
    assert!((decision.score - (-72.5)).abs() < 1e-9);
    assert_eq!(decision.failed_backends, vec!["C".to_string()]);
    assert!(outcome.resources.sample_count >= 1);
    assert!(outcome.resources.error.is_none());
}

/// Test: no capable backend fails before anything is spawned
#[tokio::test(start_paused = true)]
async fn test_capability_mismatch_spawns_nothing() {
    init_tracing();
    let linear_only = ScriptedAdapter::optimal("lp", 10, 1.0).with_caps(CapabilityProfile::new(
        [ProblemType::Linear],
        SizeClass::all().iter().copied(),
    ));
    let calls = linear_only.calls.clone();
    let coord = coordinator(vec![linear_only], CoordinatorConfig::default());

    let binary = ProblemModel::new(
        "pick",
        Objective {
            sense: ObjectiveSense::Maximize,
            expression: LinearExpr::new().term("y", 1.0),
        },
    )
    .with_variable(Variable::binary("y"));

    let err = coord
        .run_race(binary, SolveConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RaceError::CapabilityMismatch {
            problem_type: ProblemType::Binary,
            ..
        }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(coord.inflight_races(), 0);
}

/// Test: an adapter still running at the race deadline is excluded as TIMEOUT
#[tokio::test(start_paused = true)]
async fn test_race_deadline_cancels_slow_adapter() {
    init_tracing();
    let slow = ScriptedAdapter::optimal("slow", 10_000, 1.0);
    let seen_cancel = slow.seen_cancel.clone();
    let coord = coordinator(
        vec![ScriptedAdapter::optimal("fast", 100, 5.0), slow],
        CoordinatorConfig::default(),
    );
    let config = SolveConfig::default()
        .time_limit_ms(1_000)
        .per_adapter_time_limit_ms(1_000);

    let started = tokio::time::Instant::now();
    let outcome = coord.run_race(linear_model(), config).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(1_500));
    assert_eq!(outcome.selection.winner_id(), Some("fast"));
    assert_eq!(
        statuses(&outcome.results),
        vec![("fast", SolveStatus::Optimal), ("slow", SolveStatus::Timeout)]
    );
    assert_eq!(outcome.state, RaceState::TimedOut);

    let token = seen_cancel.lock().unwrap().clone().expect("slow adapter started");
    assert!(token.is_cancelled());
    assert_eq!(coord.available_adapter_slots(), 8);
}

/// Test: the per-adapter limit cuts one backend short without ending the race
#[tokio::test(start_paused = true)]
async fn test_per_adapter_limit_times_out_single_backend() {
    init_tracing();
    let coord = coordinator(
        vec![
            ScriptedAdapter::optimal("quick", 500, 10.0),
            ScriptedAdapter::optimal("sluggish", 3_000, 1.0),
        ],
        CoordinatorConfig::default(),
    );
    let config = SolveConfig::default()
        .time_limit_ms(10_000)
        .per_adapter_time_limit_ms(1_000);

    let outcome = coord.run_race(linear_model(), config).await.unwrap();

    let sluggish = &outcome.results[1];
    assert_eq!(sluggish.status, SolveStatus::Timeout);
    assert!(sluggish.reason().unwrap().contains("1000ms"));
    assert_eq!(outcome.state, RaceState::Completed);
    assert_eq!(outcome.selection.winner_id(), Some("quick"));
}

/// Test: equal objectives are broken by solve time
#[tokio::test(start_paused = true)]
async fn test_equal_objective_faster_backend_wins() {
    init_tracing();
    let coord = coordinator(
        vec![
            ScriptedAdapter::optimal("tortoise", 3_000, 50.0),
            ScriptedAdapter::optimal("hare", 1_000, 50.0),
        ],
        CoordinatorConfig::default(),
    );
    let outcome = coord
        .run_race(linear_model(), SolveConfig::default())
        .await
        .unwrap();
    assert_eq!(outcome.selection.winner_id(), Some("hare"));
}

/// Test: max_concurrent_adapters bounds simultaneous solves within a race
#[tokio::test(start_paused = true)]
async fn test_concurrency_cap_is_respected() {
    init_tracing();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let adapters = (0..4)
        .map(|i| {
            ScriptedAdapter::optimal(&format!("s{i}"), 200, 10.0 + i as f64)
                .sharing_gauges(&running, &peak)
        })
        .collect();
    let coord = coordinator(adapters, CoordinatorConfig::default());
    let config = SolveConfig::default().top_k(4).max_concurrent_adapters(2);

    let outcome = coord.run_race(linear_model(), config).await.unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(outcome
        .results
        .iter()
        .all(|r| r.status == SolveStatus::Optimal));
    assert_eq!(outcome.selection.winner_id(), Some("s0"));
    assert_eq!(coord.available_adapter_slots(), 8);
}

/// Test: the global slot pool is shared across concurrent races
#[tokio::test(start_paused = true)]
async fn test_global_slot_pool_bounds_all_races() {
    init_tracing();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let adapters = (0..3)
        .map(|i| ScriptedAdapter::optimal(&format!("g{i}"), 300, 1.0).sharing_gauges(&running, &peak))
        .collect();
    let coord = coordinator(
        adapters,
        CoordinatorConfig {
            global_max_concurrent_adapters: 2,
            max_inflight_races: 4,
        },
    )
    .shared();

    let config = SolveConfig::default().top_k(3);
    let (a, b) = tokio::join!(
        coord.run_race(linear_model(), config.clone()),
        coord.run_race(linear_model(), config),
    );

    assert!(a.unwrap().decision().is_some());
    assert!(b.unwrap().decision().is_some());
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

/// `min x` over one binary variable.
fn binary_model() -> ProblemModel {
    ProblemModel::new(
        "binary",
        Objective {
            sense: ObjectiveSense::Minimize,
            expression: LinearExpr::new().term("x", 1.0),
        },
    )
    .with_variable(Variable::binary("x"))
}

/// Test: an adapter queued behind its race's own cap leaves global slots free
#[tokio::test(start_paused = true)]
async fn test_queued_adapter_holds_no_global_slot() {
    init_tracing();
    let linear_only = CapabilityProfile::new([ProblemType::Linear], SizeClass::all().iter().copied());
    let binary_only = CapabilityProfile::new([ProblemType::Binary], SizeClass::all().iter().copied());
    let coord = coordinator(
        vec![
            ScriptedAdapter::optimal("lin0", 1_000, 1.0).with_caps(linear_only.clone()),
            ScriptedAdapter::optimal("lin1", 1_000, 2.0).with_caps(linear_only),
            ScriptedAdapter::optimal("bin0", 100, 0.0).with_caps(binary_only),
        ],
        CoordinatorConfig {
            global_max_concurrent_adapters: 2,
            max_inflight_races: 4,
        },
    )
    .shared();

    // Race A runs its two adapters one at a time.
    let linear_coord = coord.clone();
    let race_a = tokio::spawn(async move {
        linear_coord
            .run_race(linear_model(), SolveConfig::default().max_concurrent_adapters(1))
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = Instant::now();
    let b = coord
        .run_race(binary_model(), SolveConfig::default())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(b.selection.winner_id(), Some("bin0"));

    let a = race_a.await.unwrap().unwrap();
    assert_eq!(a.state, RaceState::Completed);
    assert_eq!(a.selection.winner_id(), Some("lin0"));
    assert_eq!(coord.available_adapter_slots(), 2);
}

/// Test: outcomes feed back into the performance store
#[tokio::test(start_paused = true)]
async fn test_history_updated_after_race() {
    init_tracing();
    let store = InMemoryPerformanceStore::new().shared();
    let coord = coordinator_with_store(
        vec![
            ScriptedAdapter::optimal("good", 1_000, 3.0),
            ScriptedAdapter::new("bad", 10, Script::Fail("license expired")),
        ],
        CoordinatorConfig::default(),
        store.clone(),
    );

    coord
        .run_race(linear_model(), SolveConfig::default())
        .await
        .unwrap();

    let good = store
        .lookup(&PerformanceKey::new("good", ProblemType::Linear, SizeClass::Small))
        .unwrap();
    assert_eq!(good.run_count, 1);
    assert_eq!(good.success_count, 1);
    assert!((good.total_time_secs - 1.0).abs() < 1e-9);

    let bad = store
        .lookup(&PerformanceKey::new("bad", ProblemType::Linear, SizeClass::Small))
        .unwrap();
    assert_eq!(bad.run_count, 1);
    assert_eq!(bad.success_count, 0);
}

/// Test: a result violating a constraint is not counted as a success
#[tokio::test(start_paused = true)]
async fn test_infeasible_claim_is_rejected_and_recorded_as_failure() {
    init_tracing();
    let store = InMemoryPerformanceStore::new().shared();
    let coord = coordinator_with_store(
        vec![
            // x = 500 breaks x <= 200
            ScriptedAdapter::optimal("liar", 10, 500.0),
            ScriptedAdapter::new(
                "honest",
                50,
                Script::Solve {
                    objective: 150.0,
                    status: SolveStatus::Feasible,
                },
            ),
        ],
        CoordinatorConfig::default(),
        store.clone(),
    );

    let outcome = coord
        .run_race(linear_model(), SolveConfig::default())
        .await
        .unwrap();
    let decision = outcome.decision().unwrap();
    assert_eq!(decision.winner.solver_id, "honest");
    assert_eq!(decision.rejected.len(), 1);
    assert_eq!(decision.rejected[0].solver_id, "liar");

    let liar = store
        .lookup(&PerformanceKey::new("liar", ProblemType::Linear, SizeClass::Small))
        .unwrap();
    assert_eq!(liar.success_count, 0);
}

/// Test: when nothing succeeds the selector never fabricates a winner
#[tokio::test(start_paused = true)]
async fn test_all_backends_fail_yields_no_solution() {
    init_tracing();
    let coord = coordinator(
        vec![
            ScriptedAdapter::new("x", 10, Script::Fail("boom")),
            ScriptedAdapter::new(
                "y",
                20,
                Script::Solve {
                    objective: 0.0,
                    status: SolveStatus::Infeasible,
                },
            ),
        ],
        CoordinatorConfig::default(),
    );
    let outcome = coord
        .run_race(linear_model(), SolveConfig::default())
        .await
        .unwrap();

    match outcome.selection {
        Selection::NoSolution { failed, .. } => assert_eq!(failed.len(), 2),
        Selection::Winner(d) => panic!("unexpected winner {}", d.winner.solver_id),
    }
}

/// Test: a panicking adapter is isolated from its siblings
#[tokio::test(start_paused = true)]
async fn test_panicking_adapter_becomes_error_result() {
    init_tracing();
    let coord = coordinator(
        vec![
            ScriptedAdapter::new("crashy", 10, Script::Panic),
            ScriptedAdapter::optimal("steady", 100, 7.0),
        ],
        CoordinatorConfig::default(),
    );
    let outcome = coord
        .run_race(linear_model(), SolveConfig::default())
        .await
        .unwrap();

    assert_eq!(outcome.results[0].status, SolveStatus::Error);
    assert!(outcome.results[0].reason().unwrap().contains("adapter task failed"));
    assert_eq!(outcome.selection.winner_id(), Some("steady"));
}

/// Test: top_k limits the number of launched backends
#[tokio::test(start_paused = true)]
async fn test_only_top_k_backends_launch() {
    init_tracing();
    let adapters: Vec<ScriptedAdapter> = (0..5)
        .map(|i| ScriptedAdapter::optimal(&format!("k{i}"), 10, 1.0))
        .collect();
    let calls: Vec<Arc<AtomicUsize>> = adapters.iter().map(|a| a.calls.clone()).collect();
    let coord = coordinator(adapters, CoordinatorConfig::default());

    let outcome = coord
        .run_race(linear_model(), SolveConfig::default().top_k(2))
        .await
        .unwrap();

    assert_eq!(outcome.results.len(), 2);
    let launched: usize = calls.iter().map(|c| c.load(Ordering::SeqCst)).sum();
    assert_eq!(launched, 2);
    // Ties on score fall back to registration order.
    assert_eq!(calls[0].load(Ordering::SeqCst), 1);
    assert_eq!(calls[1].load(Ordering::SeqCst), 1);
}

/// Test: races beyond max_inflight_races are rejected, not queued
#[tokio::test(start_paused = true)]
async fn test_admission_rejects_when_overloaded() {
    init_tracing();
    let coord = coordinator(
        vec![ScriptedAdapter::optimal("busy", 2_000, 1.0)],
        CoordinatorConfig {
            global_max_concurrent_adapters: 4,
            max_inflight_races: 1,
        },
    )
    .shared();

    let background = {
        let coord = coord.clone();
        tokio::spawn(async move { coord.run_race(linear_model(), SolveConfig::default()).await })
    };
    while coord.inflight_races() == 0 {
        tokio::task::yield_now().await;
    }

    let err = coord
        .run_race(linear_model(), SolveConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RaceError::Overloaded { limit: 1 }));

    assert!(background.await.unwrap().is_ok());
    assert_eq!(coord.inflight_races(), 0);
}

/// Test: after shutdown new races are refused while running ones finish
#[tokio::test(start_paused = true)]
async fn test_shutdown_refuses_new_races() {
    init_tracing();
    let coord = coordinator(
        vec![ScriptedAdapter::optimal("steady", 1_000, 1.0)],
        CoordinatorConfig::default(),
    )
    .shared();

    let running = {
        let coord = coord.clone();
        tokio::spawn(async move { coord.run_race(linear_model(), SolveConfig::default()).await })
    };
    while coord.inflight_races() == 0 {
        tokio::task::yield_now().await;
    }

    coord.shutdown();
    assert!(coord.is_shutting_down());
    let err = coord
        .run_race(linear_model(), SolveConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RaceError::ShuttingDown));

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.selection.winner_id(), Some("steady"));
}

/// Test: invalid configuration is rejected before admission
#[tokio::test(start_paused = true)]
async fn test_invalid_config_rejected() {
    init_tracing();
    let coord = coordinator(
        vec![ScriptedAdapter::optimal("a", 10, 1.0)],
        CoordinatorConfig::default(),
    );
    let err = coord
        .run_race(
            linear_model(),
            SolveConfig::default()
                .time_limit_ms(1_000)
                .per_adapter_time_limit_ms(5_000),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RaceError::InvalidConfig(_)));
}

/// Test: lifecycle events arrive in order on the bus
#[tokio::test(start_paused = true)]
async fn test_race_events_published() {
    init_tracing();
    let bus = EventBus::new().shared();
    let mut rx = bus.subscribe();
    let coord = coordinator(
        vec![
            ScriptedAdapter::optimal("a", 100, 1.0),
            ScriptedAdapter::optimal("b", 200, 2.0),
        ],
        CoordinatorConfig::default(),
    )
    .with_event_bus(bus);

    let outcome = coord
        .run_race(linear_model(), SolveConfig::default())
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.race_id(), Some(outcome.race_id));
        if let RaceEvent::RaceFinished { winner, state, .. } = &event {
            assert_eq!(winner.as_deref(), Some("a"));
            assert_eq!(*state, RaceState::Completed);
        }
        kinds.push(event.event_type());
    }
    assert_eq!(
        kinds,
        vec!["race_started", "adapter_finished", "adapter_finished", "race_finished"]
    );
}

/// Test: a failing sampler degrades the resource summary, not the race
#[tokio::test(start_paused = true)]
async fn test_monitor_unavailable_does_not_fail_race() {
    init_tracing();
    let coord = coordinator(
        vec![ScriptedAdapter::optimal("a", 100, 1.0)],
        CoordinatorConfig::default(),
    )
    .with_sampler_factory(Arc::new(|| Err(MonitorError::ProcessNotFound("test".into()))));

    let outcome = coord
        .run_race(linear_model(), SolveConfig::default())
        .await
        .unwrap();
    assert_eq!(outcome.resources.sample_count, 0);
    assert!(outcome.resources.error.is_some());
    assert_eq!(outcome.selection.winner_id(), Some("a"));
}
