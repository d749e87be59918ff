use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use coordination::consensus::{AgentResult, Aggregator, ConsensusAlgorithm};
use coordination::history::InMemoryPerformanceStore;
use coordination::problem::ProblemModel;
use coordination::race::{RaceCoordinator, SolveResult};
use serde_json::json;
use solver_agents::config::AgentsConfig;
use solver_agents::telemetry::{append_race, RaceRecord};
use solver_agents::text_adapter::TextAdapter;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "solver-agents", about = "Race solver backends and aggregate agent results")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Race the configured backends on a problem and print the outcome as JSON.
    Race {
        /// Agents configuration (TOML).
        #[arg(short, long)]
        config: PathBuf,
        /// Problem model (JSON); `-` reads stdin.
        #[arg(short, long, default_value = "-")]
        problem: PathBuf,
        /// Also aggregate the per-backend results into a consensus.
        #[arg(long)]
        consensus: bool,
    },
    /// Aggregate agent results (JSON array or id → result object).
    Aggregate {
        /// Agent results (JSON); `-` reads stdin.
        #[arg(short, long, default_value = "-")]
        input: PathBuf,
        /// Overrides the configured algorithm.
        #[arg(short, long)]
        algorithm: Option<ConsensusAlgorithm>,
        /// Agents configuration (TOML) supplying the `[consensus]` table.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Extract an agent result from free text.
    Extract {
        #[arg(long)]
        agent_id: String,
        #[arg(long, default_value = "")]
        specialization: String,
        /// Text to parse; `-` reads stdin.
        #[arg(short, long, default_value = "-")]
        input: PathBuf,
    },
    /// Print the JSON Schema for a wire type.
    Schema {
        #[arg(value_enum, default_value_t = SchemaKind::Problem)]
        kind: SchemaKind,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SchemaKind {
    Problem,
    Result,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Race {
            config,
            problem,
            consensus,
        } => race(&config, &problem, consensus).await,
        Command::Aggregate {
            input,
            algorithm,
            config,
        } => aggregate(&input, algorithm, config.as_deref()).await,
        Command::Extract {
            agent_id,
            specialization,
            input,
        } => {
            let text = read_input(&input).await?;
            let extraction = TextAdapter::new().extract(&agent_id, &specialization, &text);
            info!(agent_id = %agent_id, method = ?extraction.method, "Extraction finished");
            print_json(&extraction.result)
        }
        Command::Schema { kind } => {
            let schema = match kind {
                SchemaKind::Problem => schemars::schema_for!(ProblemModel),
                SchemaKind::Result => schemars::schema_for!(SolveResult),
            };
            print_json(&schema)
        }
    }
}

async fn race(config_path: &Path, problem_path: &Path, consensus: bool) -> Result<()> {
    let config = AgentsConfig::load(config_path)?;
    if config.backends.is_empty() {
        bail!("{} declares no [[backend]] entries", config_path.display());
    }

    let model: ProblemModel = serde_json::from_str(&read_input(problem_path).await?)
        .context("Failed to parse problem model")?;
    let problem_name = model.name.clone();

    let store = Arc::new(match &config.history_path {
        Some(path) => InMemoryPerformanceStore::load_or_default(path)
            .with_context(|| format!("Failed to load history {}", path.display()))?,
        None => InMemoryPerformanceStore::new(),
    });

    let coordinator =
        RaceCoordinator::new(config.registry()?, store.clone(), config.coordinator.clone())?;
    info!(backends = ?coordinator.registry().ids(), problem = %problem_name, "Solver race starting");

    let outcome = tokio::select! {
        outcome = coordinator.run_race(model, config.solve.clone()) => outcome?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; abandoning race");
            bail!("race interrupted");
        }
    };

    if let Some(path) = &config.history_path {
        if let Err(e) = store.save_json(path) {
            warn!(path = %path.display(), error = %e, "Failed to persist performance history");
        }
    }
    if let Some(path) = &config.telemetry_path {
        append_race(&RaceRecord::from_outcome(&problem_name, &outcome), path);
    }

    if consensus {
        let agents: BTreeMap<String, AgentResult> = outcome
            .results
            .iter()
            .map(|r| (r.solver_id.clone(), AgentResult::from_solve_result(r, "solver")))
            .collect();
        let consensus = Aggregator::new(config.consensus.clone()).aggregate_default(&agents);
        print_json(&json!({ "race": outcome, "consensus": consensus }))
    } else {
        print_json(&outcome)
    }
}

async fn aggregate(
    input: &Path,
    algorithm: Option<ConsensusAlgorithm>,
    config_path: Option<&Path>,
) -> Result<()> {
    let consensus_config = match config_path {
        Some(path) => AgentsConfig::load(path)?.consensus,
        None => Default::default(),
    };
    let raw = read_input(input).await?;
    let agents = parse_agent_results(&raw)?;

    let aggregator = Aggregator::new(consensus_config);
    let result = match algorithm {
        Some(algorithm) => aggregator.aggregate(&agents, algorithm),
        None => aggregator.aggregate_default(&agents),
    };
    if let Some(error) = &result.metadata.error {
        warn!(%error, "No consensus formed");
    }
    print_json(&result)
}

/// Accepts `[AgentResult, ...]` or `{"id": AgentResult, ...}`.
fn parse_agent_results(raw: &str) -> Result<BTreeMap<String, AgentResult>> {
    let value: serde_json::Value = serde_json::from_str(raw).context("Input is not JSON")?;
    let agents = match value {
        serde_json::Value::Array(_) => {
            let list: Vec<AgentResult> =
                serde_json::from_value(value).context("Invalid agent result list")?;
            list.into_iter().map(|a| (a.agent_id.clone(), a)).collect()
        }
        serde_json::Value::Object(_) => {
            serde_json::from_value(value).context("Invalid agent result map")?
        }
        _ => bail!("expected a JSON array or object of agent results"),
    };
    Ok(agents)
}

async fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .context("Failed to read stdin")?;
        Ok(buf)
    } else {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}
