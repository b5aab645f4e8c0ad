//! On-demand memory and CPU sampling for one process.

use std::thread;
use std::time::Duration;

use sysinfo::{
    MINIMUM_CPU_UPDATE_INTERVAL, Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System,
};
use tracing::debug;

use crate::core::types::ResourceUsage;
use crate::io::config::SamplerConfig;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Resource sampler. Side-effect free; every call builds its own process table.
#[derive(Debug, Clone)]
pub struct Sampler {
    cpu_window: Duration,
}

impl Sampler {
    pub fn new(cfg: &SamplerConfig) -> Self {
        Self {
            cpu_window: Duration::from_millis(cfg.cpu_window_ms).max(MINIMUM_CPU_UPDATE_INTERVAL),
        }
    }

    /// Resident memory and short-window CPU of `pid`. A vanished process reads as zero.
    pub fn sample(&self, pid: u32) -> ResourceUsage {
        let target = Pid::from_u32(pid);
        let refresh = ProcessRefreshKind::nothing().with_memory().with_cpu();
        let mut system = System::new_with_specifics(RefreshKind::nothing());

        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[target]), true, refresh);
        if system.process(target).is_none() {
            debug!(pid, "process vanished before sampling");
            return ResourceUsage::default();
        }
        thread::sleep(self.cpu_window);
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[target]), true, refresh);

        match system.process(target) {
            Some(process) => ResourceUsage {
                memory_mb: round_tenth(process.memory() as f64 / BYTES_PER_MB),
                cpu_percent: round_tenth(f64::from(process.cpu_usage())),
            },
            None => {
                debug!(pid, "process vanished while sampling");
                ResourceUsage::default()
            }
        }
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_one_decimal() {
        assert_eq!(round_tenth(12.345), 12.3);
        assert_eq!(round_tenth(0.06), 0.1);
    }

    #[test]
    fn window_is_raised_to_platform_minimum() {
        let sampler = Sampler::new(&SamplerConfig { cpu_window_ms: 0 });
        assert_eq!(sampler.cpu_window, MINIMUM_CPU_UPDATE_INTERVAL);
    }

    #[test]
    fn own_process_has_memory() {
        let sampler = Sampler::new(&SamplerConfig::default());
        let usage = sampler.sample(std::process::id());
        assert!(usage.memory_mb > 0.0);
        assert!(usage.cpu_percent >= 0.0);
    }

    #[cfg(unix)]
    #[test]
    fn exited_process_reads_zero() {
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let pid = child.id();
        child.wait().expect("wait");
        assert_eq!(Sampler::new(&SamplerConfig::default()).sample(pid), ResourceUsage::default());
    }
}
