//! Resource Usage Monitoring
//!
//! - [`ResourceMonitor`] samples this process' CPU and memory during a run
//! - [`HostCapacity`] reports what the machine offers, used as default
//!   capacities when none are configured

use std::time::{Duration, Instant};

use log::{debug, warn};
use once_cell::sync::Lazy;
use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, System};

/// Detected once per process.
static HOST: Lazy<HostCapacity> = Lazy::new(HostCapacity::probe);

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    pub timestamp: Instant,
    /// CPU usage percentage (0-100+)
    pub cpu_usage: f32,
    pub memory_mb: u64,
}

/// Cores and memory of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapacity {
    pub cores: usize,
    pub memory_mb: u64,
}

impl HostCapacity {
    pub fn detect() -> Self {
        *HOST
    }

    fn probe() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let capacity = Self {
            cores: num_cpus::get().max(1),
            memory_mb: system.total_memory() / (1024 * 1024),
        };
        debug!("Host capacity: {} cores, {} MB memory", capacity.cores, capacity.memory_mb);
        capacity
    }
}

/// Samples resource usage of the current process.
///
/// The first call to [`sample`](Self::sample) only primes the CPU counters;
/// later calls are rate limited by `min_interval`.
pub struct ResourceMonitor {
    system: System,
    process_id: Option<Pid>,
    samples: Vec<ResourceSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let process_id = match get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Resource monitoring disabled: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            process_id,
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        }
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn sample(&mut self) {
        let Some(pid) = self.process_id else { return };
        let now = Instant::now();
        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.warmup_done = true;
            self.last_sample = Some(now);
            return;
        }

        if self.last_sample.is_some_and(|last| now.duration_since(last) < self.min_interval) {
            return;
        }

        self.system.refresh_processes_specifics(refresh_kind);
        self.last_sample = Some(now);

        if let Some(process) = self.system.process(pid) {
            self.samples.push(ResourceSample {
                timestamp: now,
                cpu_usage: process.cpu_usage(),
                memory_mb: process.memory() / (1024 * 1024),
            });
        }
    }

    /// Human-readable summary for the run report.
    pub fn get_summary(&self) -> String {
        if self.samples.is_empty() {
            return "No resource data collected".to_string();
        }
        let min_memory = self.samples.iter().map(|s| s.memory_mb).min().unwrap_or(0);
        format!(
            "Resource Usage:\n  Average CPU: {:.1}%\n  Peak Memory: {} MB\n  Min Memory: {} MB\n  Samples: {}",
            self.average_cpu(),
            self.peak_memory_mb(),
            min_memory,
            self.samples.len()
        )
    }

    pub fn get_samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    pub fn peak_memory_mb(&self) -> u64 {
        self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0)
    }

    pub fn average_cpu(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / self.samples.len() as f32
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_host_capacity() {
        let host = HostCapacity::detect();
        assert!(host.cores >= 1);
        assert_eq!(host, HostCapacity::detect());
    }

    #[test]
    fn test_first_sample_is_warmup() {
        let mut monitor = ResourceMonitor::new();
        monitor.sample();
        assert!(monitor.get_samples().is_empty());

        thread::sleep(Duration::from_millis(300));
        monitor.sample();
        assert_eq!(monitor.get_samples().len(), 1);
        assert!(monitor.average_cpu() >= 0.0);
    }

    #[test]
    fn test_min_interval() {
        let mut monitor = ResourceMonitor::new().with_min_interval(Duration::from_millis(200));
        monitor.sample();
        monitor.sample();
        assert!(monitor.get_samples().is_empty());

        thread::sleep(Duration::from_millis(250));
        monitor.sample();
        assert!(!monitor.get_samples().is_empty());
    }

    #[test]
    fn test_summary() {
        let monitor = ResourceMonitor::new();
        assert_eq!(monitor.get_summary(), "No resource data collected");
        assert_eq!(monitor.peak_memory_mb(), 0);
    }
}
