//! Solver coordination library
//!
//! This library provides:
//! - A capability-matched solver race: the top-K backends for a problem run
//!   concurrently under one deadline and the best verified result wins
//! - A consensus aggregator merging parallel agent outputs by weighted
//!   voting, confidence aggregation, peer validation or a hybrid of the three
//!
//! # Race
//!
//! ```text
//! ProblemModel ─► CapabilityMatcher ─► top-K adapters ─► JoinSet (deadline) ─► ResultSelector
//!                       ▲                                      │
//!                       └──────── PerformanceStore ◄───────────┘
//! ```
//!
//! # Consensus
//!
//! [`consensus::Aggregator`] consumes [`consensus::AgentResult`]s. Race
//! results can be lifted with [`consensus::AgentResult::from_solve_result`].

#![allow(clippy::uninlined_format_args)]

pub mod backend;
pub mod config;
pub mod consensus;
pub mod events;
pub mod history;
pub mod matcher;
pub mod monitor;
pub mod problem;
pub mod race;

pub use backend::{
    AdapterError, AdapterRegistry, BackendAdapter, CapabilityProfile, SharedAdapter, SolveContext,
};
pub use config::{ConfigError, CoordinatorConfig, SolveConfig};
pub use consensus::{
    AgentResult, AgentStatus, Aggregator, ConsensusAlgorithm, ConsensusConfig, ConsensusResult,
};
pub use events::{EventBus, RaceEvent, SharedEventBus};
pub use history::{InMemoryPerformanceStore, PerformanceKey, PerformanceRecord, PerformanceStore};
pub use matcher::CapabilityMatcher;
pub use monitor::{ResourceMonitor, ResourceSummary};
pub use problem::{
    Constraint, ConstraintSense, LinearExpr, Objective, ObjectiveSense, ProblemModel,
    ProblemType, SizeClass, Variable, VariableKind,
};
pub use race::{
    RaceCoordinator, RaceError, RaceOutcome, RaceState, Selection, SolveResult, SolveStatus,
};
