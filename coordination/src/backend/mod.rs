//! Backend adapter contract.
//!
//! Every solving strategy sits behind one trait, resolved once at
//! registration. The coordinator never inspects input shapes at call time:
//! capability is whatever the adapter declared up front.
//!
//! ```text
//! AdapterRegistry::builder()
//!   .register(adapter_a)   → index 0
//!   .register(adapter_b)   → index 1
//!   .build()               → frozen, read-only during races
//!
//! RaceCoordinator
//!   → adapter.solve(model, config, SolveContext { deadline, cancel })
//!       Ok(SolveResult)      → kept (any status)
//!       Err(AdapterError)    → SolveResult{ERROR}, siblings unaffected
//! ```
//!
//! At the race deadline the coordinator cancels `SolveContext::cancel` and
//! aborts the task in the same step. Late results are never collected, so
//! adapters must not rely on running after cancellation; out-of-process
//! adapters kill their child when the future is dropped.

pub mod capability;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SolveConfig;
use crate::problem::ProblemModel;
use crate::race::result::SolveResult;

pub use capability::CapabilityProfile;
pub use registry::{AdapterRegistry, AdapterRegistryBuilder, RegisteredAdapter, RegistryError};

/// Errors an adapter may raise. The coordinator converts every variant to a
/// `SolveResult` with status `ERROR` (or `TIMEOUT` for `Cancelled`).
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("backend execution failed: {0}")]
    Execution(String),

    #[error("backend cancelled before completion")]
    Cancelled,

    #[error("backend produced invalid output: {0}")]
    InvalidOutput(String),

    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Per-invocation context handed to `solve`.
#[derive(Debug, Clone)]
pub struct SolveContext {
    /// Effective deadline: `min(race deadline, now + per-adapter limit)`.
    pub deadline: Instant,
    /// Cancelled when the race deadline passes or the race is torn down.
    pub cancel: CancellationToken,
}

impl SolveContext {
    pub fn new(deadline: Instant, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    /// Time left before the deadline (zero once passed).
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Uniform interface each pluggable solver implements.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Stable identifier, used as `SolveResult::solver_id` and history key.
    fn id(&self) -> &str;

    /// Static capability declaration. Must not depend on the input.
    fn capabilities(&self) -> &CapabilityProfile;

    /// Solve `model` before `ctx.deadline`.
    async fn solve(
        &self,
        model: Arc<ProblemModel>,
        config: &SolveConfig,
        ctx: SolveContext,
    ) -> Result<SolveResult, AdapterError>;
}

pub type SharedAdapter = Arc<dyn BackendAdapter>;
