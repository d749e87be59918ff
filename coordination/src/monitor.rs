//! Resource monitor: best-effort CPU / memory sampling during a race.
//!
//! ```text
//! ResourceMonitor::start(sampler, interval)
//!   └─ spawn: loop {
//!        select! { stop.cancelled() → break,
//!                  interval.tick()  → continue }
//!        spawn_blocking(sampler.sample()) → fold into stats
//!      }
//! MonitorHandle::stop() → ResourceSummary
//! ```
//!
//! Sampling failures are logged and counted, never propagated: the race
//! neither waits on nor fails because of the monitor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("cannot determine current process id: {0}")]
    Pid(String),

    #[error("process {0} not visible to the sampler")]
    ProcessNotFound(String),
}

/// One point-in-time reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Source of resource readings.
pub trait ResourceSampler: Send + 'static {
    fn sample(&mut self) -> Result<ResourceSample, MonitorError>;
}

impl ResourceSampler for Box<dyn ResourceSampler> {
    fn sample(&mut self) -> Result<ResourceSample, MonitorError> {
        (**self).sample()
    }
}

/// Samples the current process through `sysinfo`.
pub struct ProcessSampler {
    system: System,
    pid: Pid,
}

impl ProcessSampler {
    pub fn current() -> Result<Self, MonitorError> {
        let pid = sysinfo::get_current_pid().map_err(|e| MonitorError::Pid(e.to_string()))?;
        Ok(Self {
            system: System::new(),
            pid,
        })
    }
}

impl ResourceSampler for ProcessSampler {
    fn sample(&mut self) -> Result<ResourceSample, MonitorError> {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let process = self
            .system
            .process(self.pid)
            .ok_or_else(|| MonitorError::ProcessNotFound(self.pid.to_string()))?;
        Ok(ResourceSample {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
        })
    }
}

/// Aggregated stats attached to a race outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub sample_count: u64,
    pub avg_cpu_percent: f64,
    pub max_cpu_percent: f64,
    pub avg_memory_mb: f64,
    pub max_memory_mb: f64,
    /// Samples that failed and were skipped.
    pub failed_samples: u64,
    /// Peak memory went above the configured limit.
    pub memory_limit_exceeded: bool,
    /// Set when the monitor could not run at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResourceSummary {
    /// Summary for a race whose monitor never started.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct Accumulator {
    count: u64,
    failed: u64,
    cpu_sum: f64,
    cpu_max: f64,
    mem_sum: f64,
    mem_max: f64,
}

impl Accumulator {
    fn push(&mut self, sample: ResourceSample) {
        let cpu = f64::from(sample.cpu_percent);
        let mem = sample.memory_bytes as f64 / BYTES_PER_MB;
        self.count += 1;
        self.cpu_sum += cpu;
        self.cpu_max = self.cpu_max.max(cpu);
        self.mem_sum += mem;
        self.mem_max = self.mem_max.max(mem);
    }

    fn finish(self, memory_limit_mb: u64) -> ResourceSummary {
        let n = self.count.max(1) as f64;
        ResourceSummary {
            sample_count: self.count,
            avg_cpu_percent: self.cpu_sum / n,
            max_cpu_percent: self.cpu_max,
            avg_memory_mb: self.mem_sum / n,
            max_memory_mb: self.mem_max,
            failed_samples: self.failed,
            memory_limit_exceeded: memory_limit_mb > 0 && self.mem_max > memory_limit_mb as f64,
            error: None,
        }
    }
}

pub struct ResourceMonitor;

impl ResourceMonitor {
    /// Start sampling every `interval`; the first sample is taken immediately.
    pub fn start<S: ResourceSampler>(
        mut sampler: S,
        interval: Duration,
        memory_limit_mb: u64,
    ) -> MonitorHandle {
        let stop = CancellationToken::new();
        let token = stop.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut acc = Accumulator::default();

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // Process refreshes read /proc and block; keep them off the workers.
                let sampled = tokio::task::spawn_blocking(move || {
                    let reading = sampler.sample();
                    (sampler, reading)
                })
                .await;
                let reading = match sampled {
                    Ok((returned, reading)) => {
                        sampler = returned;
                        reading
                    }
                    Err(e) => {
                        acc.failed += 1;
                        warn!(error = %e, "Resource sampler panicked; monitor stopping");
                        break;
                    }
                };
                match reading {
                    Ok(sample) => acc.push(sample),
                    Err(e) => {
                        acc.failed += 1;
                        warn!(error = %e, "Resource sample failed");
                    }
                }
            }
            acc.finish(memory_limit_mb)
        });

        MonitorHandle {
            stop,
            task: Some(task),
        }
    }
}

/// Running monitor. Dropping it stops sampling without a summary.
pub struct MonitorHandle {
    stop: CancellationToken,
    task: Option<JoinHandle<ResourceSummary>>,
}

impl MonitorHandle {
    /// Stop sampling and return the aggregated summary.
    pub async fn stop(mut self) -> ResourceSummary {
        self.stop.cancel();
        let Some(task) = self.task.take() else {
            return ResourceSummary::unavailable("monitor already stopped");
        };
        match task.await {
            Ok(summary) => {
                debug!(samples = summary.sample_count, "Resource monitor stopped");
                summary
            }
            Err(e) => {
                warn!(error = %e, "Resource monitor task failed");
                ResourceSummary::unavailable(format!("monitor task failed: {e}"))
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct FakeSampler {
        readings: Vec<ResourceSample>,
        calls: usize,
    }

    impl ResourceSampler for FakeSampler {
        fn sample(&mut self) -> Result<ResourceSample, MonitorError> {
            let i = self.calls;
            self.calls += 1;
            self.readings
                .get(i % self.readings.len())
                .copied()
                .ok_or_else(|| MonitorError::ProcessNotFound("fake".into()))
        }
    }

    struct FailingSampler;

    impl ResourceSampler for FailingSampler {
        fn sample(&mut self) -> Result<ResourceSample, MonitorError> {
            Err(MonitorError::ProcessNotFound("gone".into()))
        }
    }

    fn sample(cpu: f32, mb: u64) -> ResourceSample {
        ResourceSample {
            cpu_percent: cpu,
            memory_bytes: mb * 1024 * 1024,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_count_tracks_elapsed_intervals() {
        let sampler = FakeSampler {
            readings: vec![sample(10.0, 100), sample(30.0, 300), sample(20.0, 200)],
            calls: 0,
        };
        let interval = Duration::from_secs(1);
        let handle = ResourceMonitor::start(sampler, interval, 0);

        let elapsed = Duration::from_millis(3_500);
        tokio::time::sleep(elapsed).await;
        let summary = handle.stop().await;

        let expected = elapsed.as_secs_f64() / interval.as_secs_f64();
        assert!(
            (summary.sample_count as f64 - expected).abs() <= 1.0,
            "sample_count {} vs expected {expected}",
            summary.sample_count
        );
        assert!(summary.avg_cpu_percent <= summary.max_cpu_percent);
        assert!(summary.avg_memory_mb <= summary.max_memory_mb);
        assert_eq!(summary.max_cpu_percent, 30.0);
        assert_eq!(summary.max_memory_mb, 300.0);
        assert!(!summary.memory_limit_exceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_counted_not_fatal() {
        let handle = ResourceMonitor::start(FailingSampler, Duration::from_secs(1), 0);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let summary = handle.stop().await;
        assert_eq!(summary.sample_count, 0);
        assert!(summary.failed_samples >= 2);
        assert_eq!(summary.avg_cpu_percent, 0.0);
        assert!(summary.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_limit_flag() {
        let sampler = FakeSampler {
            readings: vec![sample(5.0, 512)],
            calls: 0,
        };
        let handle = ResourceMonitor::start(sampler, Duration::from_secs(1), 256);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let summary = handle.stop().await;
        assert!(summary.memory_limit_exceeded);
    }

    struct ThreadRecordingSampler {
        threads: Arc<Mutex<Vec<std::thread::ThreadId>>>,
    }

    impl ResourceSampler for ThreadRecordingSampler {
        fn sample(&mut self) -> Result<ResourceSample, MonitorError> {
            self.threads
                .lock()
                .unwrap()
                .push(std::thread::current().id());
            Ok(sample(1.0, 1))
        }
    }

    #[tokio::test]
    async fn test_sampling_runs_off_the_async_thread() {
        let threads = Arc::new(Mutex::new(Vec::new()));
        let sampler = ThreadRecordingSampler {
            threads: threads.clone(),
        };
        let handle = ResourceMonitor::start(sampler, Duration::from_millis(10), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let summary = handle.stop().await;

        assert!(summary.sample_count >= 1);
        let async_thread = std::thread::current().id();
        let threads = threads.lock().unwrap();
        assert!(!threads.is_empty());
        assert!(threads.iter().all(|id| *id != async_thread));
    }

    #[tokio::test]
    async fn test_process_sampler_reads_self() {
        let mut sampler = ProcessSampler::current().unwrap();
        let reading = sampler.sample().unwrap();
        assert!(reading.memory_bytes > 0);
    }
}
