//! Race configuration: time budgets, tolerances, and concurrency ceilings.
//!
//! `SolveConfig` is immutable per race and passed by value into the
//! coordinator. `CoordinatorConfig` is process-wide and sizes the shared
//! adapter semaphore and the race admission queue.
//!
//! # Usage
//!
//! ```rust,ignore
//! use coordination::config::SolveConfig;
//!
//! let config = SolveConfig::default()
//!     .time_limit_ms(30_000)
//!     .per_adapter_time_limit_ms(10_000)
//!     .top_k(3);
//! config.validate()?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

const ENV_TIME_LIMIT_MS: &str = "SOLVER_TIME_LIMIT_MS";
const ENV_PER_ADAPTER_LIMIT_MS: &str = "SOLVER_PER_ADAPTER_TIME_LIMIT_MS";
const ENV_MEMORY_LIMIT_MB: &str = "SOLVER_MEMORY_LIMIT_MB";
const ENV_MAX_CONCURRENT: &str = "SOLVER_MAX_CONCURRENT_ADAPTERS";
const ENV_TOP_K: &str = "SOLVER_TOP_K";
const ENV_FEASIBILITY_TOL: &str = "SOLVER_FEASIBILITY_TOLERANCE";

/// Invalid configuration. Raised synchronously before any work starts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("per-adapter time limit ({per_adapter_ms}ms) exceeds race time limit ({race_ms}ms)")]
    AdapterLimitExceedsRace { per_adapter_ms: u64, race_ms: u64 },

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Per-race solve budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveConfig {
    /// Global race deadline in milliseconds.
    pub time_limit_ms: u64,
    /// Per-adapter deadline in milliseconds (capped by the race deadline).
    pub per_adapter_time_limit_ms: u64,
    /// Memory ceiling advertised to adapters and checked by the monitor (0 = unlimited).
    pub memory_limit_mb: u64,
    /// Maximum constraint/bound violation accepted by the validator.
    pub feasibility_tolerance: f64,
    /// Maximum distance from an integer for integral variables.
    pub integrality_tolerance: f64,
    /// Relative MIP gap above which an OPTIMAL claim ranks as FEASIBLE.
    pub gap_tolerance: f64,
    /// Maximum adapters of this race running at once.
    pub max_concurrent_adapters: usize,
    /// Number of candidates the matcher hands to the race.
    pub top_k: usize,
    /// Weight of objective quality in the selection score (w1).
    pub objective_weight: f64,
    /// Weight of solve speed in the selection score (w2).
    pub speed_weight: f64,
    /// Resource monitor sampling interval.
    pub monitor_interval_ms: u64,
}

impl Default for SolveConfig {
    /// 60s race, 30s per adapter, 1e-6 feasibility, top 3, w1=0.75 / w2=0.25.
    fn default() -> Self {
        Self {
            time_limit_ms: 60_000,
            per_adapter_time_limit_ms: 30_000,
            memory_limit_mb: 0,
            feasibility_tolerance: 1e-6,
            integrality_tolerance: 1e-6,
            gap_tolerance: 1e-4,
            max_concurrent_adapters: 4,
            top_k: 3,
            objective_weight: 0.75,
            speed_weight: 0.25,
            monitor_interval_ms: 1_000,
        }
    }
}

impl SolveConfig {
    /// Defaults with `SOLVER_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse(ENV_TIME_LIMIT_MS) {
            config.time_limit_ms = v;
        }
        if let Some(v) = env_parse(ENV_PER_ADAPTER_LIMIT_MS) {
            config.per_adapter_time_limit_ms = v;
        }
        if let Some(v) = env_parse(ENV_MEMORY_LIMIT_MB) {
            config.memory_limit_mb = v;
        }
        if let Some(v) = env_parse(ENV_MAX_CONCURRENT) {
            config.max_concurrent_adapters = v;
        }
        if let Some(v) = env_parse(ENV_TOP_K) {
            config.top_k = v;
        }
        if let Some(v) = env_parse(ENV_FEASIBILITY_TOL) {
            config.feasibility_tolerance = v;
        }
        config
    }

    /// Parse from a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn time_limit_ms(mut self, ms: u64) -> Self {
        self.time_limit_ms = ms;
        self
    }

    pub fn per_adapter_time_limit_ms(mut self, ms: u64) -> Self {
        self.per_adapter_time_limit_ms = ms;
        self
    }

    pub fn memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    pub fn feasibility_tolerance(mut self, tol: f64) -> Self {
        self.feasibility_tolerance = tol;
        self
    }

    pub fn max_concurrent_adapters(mut self, n: usize) -> Self {
        self.max_concurrent_adapters = n;
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn weights(mut self, objective: f64, speed: f64) -> Self {
        self.objective_weight = objective;
        self.speed_weight = speed;
        self
    }

    pub fn monitor_interval_ms(mut self, ms: u64) -> Self {
        self.monitor_interval_ms = ms;
        self
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms)
    }

    pub fn per_adapter_time_limit(&self) -> Duration {
        Duration::from_millis(self.per_adapter_time_limit_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Reject configurations that would make a race meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_limit_ms == 0 {
            return Err(ConfigError::Zero {
                field: "time_limit_ms",
            });
        }
        if self.per_adapter_time_limit_ms == 0 {
            return Err(ConfigError::Zero {
                field: "per_adapter_time_limit_ms",
            });
        }
        if self.per_adapter_time_limit_ms > self.time_limit_ms {
            return Err(ConfigError::AdapterLimitExceedsRace {
                per_adapter_ms: self.per_adapter_time_limit_ms,
                race_ms: self.time_limit_ms,
            });
        }
        if self.max_concurrent_adapters == 0 {
            return Err(ConfigError::Zero {
                field: "max_concurrent_adapters",
            });
        }
        if self.top_k == 0 {
            return Err(ConfigError::Zero { field: "top_k" });
        }
        if self.monitor_interval_ms == 0 {
            return Err(ConfigError::Zero {
                field: "monitor_interval_ms",
            });
        }
        check_range("feasibility_tolerance", self.feasibility_tolerance, 0.0, 1.0)?;
        check_range("integrality_tolerance", self.integrality_tolerance, 0.0, 0.5)?;
        check_range("gap_tolerance", self.gap_tolerance, 0.0, 1.0)?;
        check_range("objective_weight", self.objective_weight, 0.0, 1.0)?;
        check_range("speed_weight", self.speed_weight, 0.0, 1.0)?;
        Ok(())
    }
}

/// Process-wide limits shared by every race on one coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Ceiling on adapter tasks running at once across all races.
    pub global_max_concurrent_adapters: usize,
    /// Races admitted at once; further races are rejected as overloaded.
    pub max_inflight_races: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            global_max_concurrent_adapters: 8,
            max_inflight_races: 16,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global_max_concurrent_adapters == 0 {
            return Err(ConfigError::Zero {
                field: "global_max_concurrent_adapters",
            });
        }
        if self.max_inflight_races == 0 {
            return Err(ConfigError::Zero {
                field: "max_inflight_races",
            });
        }
        Ok(())
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
