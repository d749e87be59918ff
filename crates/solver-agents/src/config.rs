use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use coordination::backend::{AdapterRegistry, CapabilityProfile};
use coordination::config::{CoordinatorConfig, SolveConfig};
use coordination::consensus::ConsensusConfig;
use coordination::problem::{ProblemType, SizeClass};
use serde::Deserialize;

use crate::process_adapter::{ExternalProcessAdapter, ProcessSpec};

/// Extra score for one (problem type, size class) pair.
#[derive(Debug, Clone, Deserialize)]
pub struct BonusEntry {
    pub problem_type: ProblemType,
    pub size_class: SizeClass,
    pub bonus: f64,
}

/// One `[[backend]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendEntry {
    pub id: String,
    /// Shell-style command line, split with shell quoting rules.
    pub command: String,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Empty means every problem type.
    #[serde(default)]
    pub problem_types: BTreeSet<ProblemType>,
    /// Empty means every size class.
    #[serde(default)]
    pub size_classes: BTreeSet<SizeClass>,
    #[serde(default = "default_base_score")]
    pub base_score: f64,
    #[serde(default)]
    pub bonuses: Vec<BonusEntry>,
}

fn default_base_score() -> f64 {
    1.0
}

impl BackendEntry {
    pub fn capabilities(&self) -> CapabilityProfile {
        let types: Vec<ProblemType> = if self.problem_types.is_empty() {
            ProblemType::all().to_vec()
        } else {
            self.problem_types.iter().copied().collect()
        };
        let sizes: Vec<SizeClass> = if self.size_classes.is_empty() {
            SizeClass::all().to_vec()
        } else {
            self.size_classes.iter().copied().collect()
        };
        self.bonuses.iter().fold(
            CapabilityProfile::new(types, sizes).with_base_score(self.base_score),
            |profile, b| profile.with_bonus(b.problem_type, b.size_class, b.bonus),
        )
    }

    pub fn process_spec(&self) -> Result<ProcessSpec> {
        let Some(mut spec) = ProcessSpec::from_command_line(&self.command) else {
            bail!("backend '{}': cannot parse command '{}'", self.id, self.command);
        };
        spec.working_dir = self.working_dir.clone();
        spec.env = self.env.clone();
        Ok(spec)
    }
}

/// Top-level configuration file.
///
/// ```toml
/// history_path = "solver-history.json"
/// telemetry_path = "races.jsonl"
///
/// [solve]
/// time_limit_ms = 30000
/// top_k = 2
///
/// [coordinator]
/// global_max_concurrent_adapters = 8
///
/// [consensus]
/// algorithm = "hybrid"
///
/// [[backend]]
/// id = "highs"
/// command = "highs-json --threads 2"
/// problem_types = ["linear", "mixed_integer"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub solve: SolveConfig,
    pub coordinator: CoordinatorConfig,
    pub consensus: ConsensusConfig,
    #[serde(rename = "backend")]
    pub backends: Vec<BackendEntry>,
    /// Where the performance history is persisted between runs.
    pub history_path: Option<PathBuf>,
    /// JSONL file receiving one line per race.
    pub telemetry_path: Option<PathBuf>,
}

impl AgentsConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("Failed to parse agents config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        self.solve.validate().context("[solve]")?;
        self.coordinator.validate().context("[coordinator]")?;
        let mut seen = BTreeSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.id.as_str()) {
                bail!("duplicate backend id '{}'", backend.id);
            }
            backend.process_spec()?;
        }
        Ok(())
    }

    /// Build the adapter registry, one external-process adapter per backend.
    pub fn registry(&self) -> Result<AdapterRegistry> {
        let mut builder = AdapterRegistry::builder();
        for backend in &self.backends {
            builder = builder
                .register(ExternalProcessAdapter::new(
                    backend.id.clone(),
                    backend.process_spec()?,
                    backend.capabilities(),
                ))
                .with_context(|| format!("Failed to register backend '{}'", backend.id))?;
        }
        Ok(builder.build())
    }
}
