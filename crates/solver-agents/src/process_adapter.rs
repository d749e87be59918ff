//! Backend adapter for solvers that run as external executables.
//!
//! Protocol: the child receives one JSON [`SolveRequest`] on stdin and must
//! print one JSON [`BackendReply`] on stdout before exiting. The child runs
//! in its own process group. The whole group is killed when the deadline
//! passes, the race cancels it, or the adapter future is dropped, so workers
//! forked by a wrapper script do not outlive the solve.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coordination::backend::{AdapterError, BackendAdapter, CapabilityProfile, SolveContext};
use coordination::config::SolveConfig;
use coordination::problem::ProblemModel;
use coordination::race::{SolveResult, SolveStatus};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Bytes of stderr kept for error messages.
const STDERR_TAIL_BYTES: usize = 2048;

/// What the child reads from stdin.
#[derive(Debug, Serialize)]
pub struct SolveRequest<'a> {
    pub model: &'a ProblemModel,
    pub config: &'a SolveConfig,
    /// Wall-clock budget left when the child was started.
    pub time_limit_ms: u64,
}

/// What the child prints on stdout.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendReply {
    pub status: SolveStatus,
    #[serde(default)]
    pub objective_value: Option<f64>,
    #[serde(default)]
    pub variable_assignment: BTreeMap<String, f64>,
    #[serde(default)]
    pub solve_time_secs: Option<f64>,
    #[serde(default)]
    pub iterations: Option<u64>,
    #[serde(default)]
    pub gap: Option<f64>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl BackendReply {
    fn into_result(self, solver_id: &str, elapsed: Duration) -> SolveResult {
        let solve_time = self
            .solve_time_secs
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .unwrap_or(elapsed);
        SolveResult {
            solver_id: solver_id.to_string(),
            status: self.status,
            objective_value: self.objective_value,
            variable_assignment: self.variable_assignment,
            solve_time,
            iterations: self.iterations,
            gap: self.gap,
            metadata: self.metadata,
        }
    }
}

/// How to launch one external solver.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Split a shell-style command line into program and arguments.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = shlex::split(line)?.into_iter();
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            working_dir: None,
            env: BTreeMap::new(),
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group: terminal signals aimed at us don't reach the
        // solver, and `GroupKill` can take down everything it started.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

pub struct ExternalProcessAdapter {
    id: String,
    spec: ProcessSpec,
    capabilities: CapabilityProfile,
}

/// Kills the child's process group on `fire` or drop, unless disarmed.
///
/// Dropping the adapter future (race abort) bypasses `terminate`; this guard
/// covers that path for descendants `kill_on_drop` cannot reach.
struct GroupKill {
    pgid: Option<u32>,
}

impl GroupKill {
    fn arm(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn fire(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        self.fire();
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; it touches no memory of ours.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, error = %err, "Failed to kill solver process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

enum Exit {
    Finished(std::io::Result<(ExitStatus, Vec<u8>, Vec<u8>)>),
    Cancelled,
    DeadlinePassed,
}

impl ExternalProcessAdapter {
    pub fn new(id: impl Into<String>, spec: ProcessSpec, capabilities: CapabilityProfile) -> Self {
        Self {
            id: id.into(),
            spec,
            capabilities,
        }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    async fn terminate(&self, child: &mut Child) {
        if let Err(e) = child.kill().await {
            warn!(solver_id = %self.id, error = %e, "Failed to kill solver process");
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

#[async_trait]
impl BackendAdapter for ExternalProcessAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &CapabilityProfile {
        &self.capabilities
    }

    async fn solve(
        &self,
        model: Arc<ProblemModel>,
        config: &SolveConfig,
        ctx: SolveContext,
    ) -> Result<SolveResult, AdapterError> {
        let request = serde_json::to_vec(&SolveRequest {
            model: &model,
            config,
            time_limit_ms: ctx.remaining().as_millis() as u64,
        })
        .map_err(|e| AdapterError::Internal(e.into()))?;

        let started = Instant::now();
        let mut child = self.spec.command().spawn()?;
        let mut group = GroupKill::arm(&child);
        debug!(solver_id = %self.id, pid = ?child.id(), program = %self.spec.program, "Solver process spawned");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let exit = {
            let run = async {
                let feed = async {
                    if let Some(mut stdin) = stdin {
                        // A solver that exits without reading stdin is not an error here.
                        if let Err(e) = stdin.write_all(&request).await {
                            debug!(solver_id = %self.id, error = %e, "Solver closed stdin early");
                        }
                    }
                };
                let (_, out, err, status) =
                    tokio::join!(feed, read_all(stdout), read_all(stderr), child.wait());
                Ok::<_, std::io::Error>((status?, out?, err?))
            };
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Exit::Cancelled,
                _ = tokio::time::sleep_until(ctx.deadline) => Exit::DeadlinePassed,
                finished = run => Exit::Finished(finished),
            }
        };

        let elapsed = started.elapsed();
        let (status, stdout, stderr) = match exit {
            Exit::Cancelled => {
                group.fire();
                self.terminate(&mut child).await;
                return Err(AdapterError::Cancelled);
            }
            Exit::DeadlinePassed => {
                group.fire();
                self.terminate(&mut child).await;
                return Ok(SolveResult::timeout(
                    self.id.clone(),
                    format!("solver process killed after {}ms", elapsed.as_millis()),
                )
                .with_solve_time(elapsed));
            }
            Exit::Finished(finished) => finished?,
        };
        // Leader reaped; its pid may be reused from here on.
        group.disarm();

        if !status.success() {
            return Err(AdapterError::Execution(format!(
                "solver exited with {status}: {}",
                stderr_tail(&stderr)
            )));
        }

        let reply: BackendReply = serde_json::from_slice(&stdout).map_err(|e| {
            AdapterError::InvalidOutput(format!(
                "{e} (stdout was {} bytes, stderr: {})",
                stdout.len(),
                stderr_tail(&stderr)
            ))
        })?;
        debug!(solver_id = %self.id, status = %reply.status, elapsed_ms = elapsed.as_millis() as u64, "Solver process finished");
        Ok(reply.into_result(&self.id, elapsed))
    }
}
