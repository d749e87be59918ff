//! Performance history: per (backend, problem type, size class) run stats.
//!
//! One store is shared by every race on a coordinator. The matcher reads it
//! when ranking candidates; the coordinator writes one outcome per adapter
//! after each race. Each update is a read-modify-write under a single lock,
//! so concurrent races never lose increments.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::problem::{ProblemType, SizeClass};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("history serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PerformanceKey {
    pub backend_id: String,
    pub problem_type: ProblemType,
    pub size_class: SizeClass,
}

impl PerformanceKey {
    pub fn new(backend_id: impl Into<String>, problem_type: ProblemType, size_class: SizeClass) -> Self {
        Self {
            backend_id: backend_id.into(),
            problem_type,
            size_class,
        }
    }
}

/// Accumulated statistics for one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub run_count: u64,
    pub success_count: u64,
    /// Sum of solve times over all runs, in seconds.
    pub total_time_secs: f64,
}

impl PerformanceRecord {
    /// Fraction of runs that produced a usable solution (0.0 with no runs).
    pub fn success_rate(&self) -> f64 {
        if self.run_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.run_count as f64
        }
    }

    pub fn avg_time(&self) -> Option<Duration> {
        if self.run_count == 0 {
            return None;
        }
        Duration::try_from_secs_f64(self.total_time_secs / self.run_count as f64).ok()
    }

    pub fn record(&mut self, success: bool, duration: Duration) {
        self.run_count += 1;
        if success {
            self.success_count += 1;
        }
        self.total_time_secs += duration.as_secs_f64();
    }
}

/// Get / merge-update store of performance records.
#[cfg_attr(test, mockall::automock)]
pub trait PerformanceStore: Send + Sync {
    fn lookup(&self, key: &PerformanceKey) -> Option<PerformanceRecord>;

    /// Atomically fold one outcome into the record for `key`.
    fn record_outcome(&self, key: PerformanceKey, success: bool, duration: Duration);

    /// Every record, in no particular order.
    fn snapshot(&self) -> Vec<(PerformanceKey, PerformanceRecord)>;
}

pub type SharedPerformanceStore = Arc<dyn PerformanceStore>;

/// Mutex-guarded in-process store with optional JSON persistence.
#[derive(Debug, Default)]
pub struct InMemoryPerformanceStore {
    records: Mutex<HashMap<PerformanceKey, PerformanceRecord>>,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    key: PerformanceKey,
    record: PerformanceRecord,
}

impl InMemoryPerformanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedPerformanceStore {
        Arc::new(self)
    }

    /// Load a store previously written by [`save_json`](Self::save_json).
    pub fn load_json(path: &Path) -> Result<Self, HistoryError> {
        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<PersistedEntry> = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), entries = entries.len(), "Loaded performance history");
        let records = entries.into_iter().map(|e| (e.key, e.record)).collect();
        Ok(Self {
            records: Mutex::new(records),
        })
    }

    /// Like `load_json`, but a missing file yields an empty store.
    pub fn load_or_default(path: &Path) -> Result<Self, HistoryError> {
        if path.exists() {
            Self::load_json(path)
        } else {
            Ok(Self::new())
        }
    }

    pub fn save_json(&self, path: &Path) -> Result<(), HistoryError> {
        let mut entries: Vec<PersistedEntry> = self
            .snapshot()
            .into_iter()
            .map(|(key, record)| PersistedEntry { key, record })
            .collect();
        entries.sort_by(|a, b| {
            (&a.key.backend_id, a.key.problem_type, a.key.size_class).cmp(&(
                &b.key.backend_id,
                b.key.problem_type,
                b.key.size_class,
            ))
        });
        let json = serde_json::to_string_pretty(&entries)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<PerformanceKey, PerformanceRecord>> {
        // Each update is a single fold, so a poisoned map is still consistent.
        self.records.lock().unwrap_or_else(|poisoned| {
            warn!("Performance history lock poisoned; continuing with inner state");
            poisoned.into_inner()
        })
    }
}

impl PerformanceStore for InMemoryPerformanceStore {
    fn lookup(&self, key: &PerformanceKey) -> Option<PerformanceRecord> {
        self.guard().get(key).cloned()
    }

    fn record_outcome(&self, key: PerformanceKey, success: bool, duration: Duration) {
        self.guard().entry(key).or_default().record(success, duration);
    }

    fn snapshot(&self) -> Vec<(PerformanceKey, PerformanceRecord)> {
        self.guard()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
