//! System resource sampling for the scheduler's throttle gate.

use std::path::{Path, PathBuf};

use sysinfo::{Disks, System};
use tracing::debug;

use foliofox_config::ResourceThresholds;

/// One CPU/memory/disk reading, in percent used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
}

/// Samples host resources against configured ceilings. New downloads are
/// paused while any reading is above its threshold.
#[derive(Debug)]
pub struct ResourceMonitor {
    system: System,
    disks: Disks,
    thresholds: ResourceThresholds,
    watch_path: PathBuf,
}

impl ResourceMonitor {
    pub fn new(thresholds: ResourceThresholds, watch_path: &Path) -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
            thresholds,
            watch_path: watch_path.to_path_buf(),
        }
    }

    /// Refresh and read current usage. CPU usage needs two refreshes to be
    /// meaningful; the first call of a process returns a low reading and
    /// corrects itself on the next tick.
    pub fn sample(&mut self) -> ResourceSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh(true);

        let cpu_percent = self.system.global_cpu_usage();
        let memory_percent = if self.system.total_memory() == 0 {
            0.0
        } else {
            self.system.used_memory() as f32 / self.system.total_memory() as f32 * 100.0
        };
        let disk_percent = self.disk_usage_percent().unwrap_or(0.0);

        ResourceSample {
            cpu_percent,
            memory_percent,
            disk_percent,
        }
    }

    /// Usage of the disk holding the download directory: the longest mount
    /// point that prefixes it wins.
    fn disk_usage_percent(&self) -> Option<f32> {
        let disk = self
            .disks
            .list()
            .iter()
            .filter(|d| self.watch_path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())?;
        if disk.total_space() == 0 {
            return None;
        }
        let used = disk.total_space().saturating_sub(disk.available_space());
        Some(used as f32 / disk.total_space() as f32 * 100.0)
    }

    /// Which resource, if any, is past its ceiling.
    pub fn over_threshold(&mut self) -> Option<(&'static str, f32)> {
        let sample = self.sample();
        if sample.cpu_percent > self.thresholds.cpu_percent {
            debug!(cpu = sample.cpu_percent, "cpu over threshold");
            return Some(("cpu", sample.cpu_percent));
        }
        if sample.memory_percent > self.thresholds.memory_percent {
            debug!(memory = sample.memory_percent, "memory over threshold");
            return Some(("memory", sample.memory_percent));
        }
        if sample.disk_percent > self.thresholds.disk_percent {
            debug!(disk = sample.disk_percent, "disk over threshold");
            return Some(("disk", sample.disk_percent));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_returns_plausible_percentages() {
        let mut monitor =
            ResourceMonitor::new(ResourceThresholds::default(), Path::new("/"));
        let sample = monitor.sample();
        assert!(sample.memory_percent >= 0.0 && sample.memory_percent <= 100.0);
        assert!(sample.disk_percent >= 0.0 && sample.disk_percent <= 100.0);
    }

    #[test]
    fn test_unreachable_thresholds_never_trip() {
        let thresholds = ResourceThresholds {
            cpu_percent: 1_000.0,
            memory_percent: 1_000.0,
            disk_percent: 1_000.0,
        };
        let mut monitor = ResourceMonitor::new(thresholds, Path::new("/"));
        assert!(monitor.over_threshold().is_none());
    }
}
