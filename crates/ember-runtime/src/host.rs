use std::path::Path;

use async_trait::async_trait;
use sysinfo::{Disks, System};
use tokio::sync::Mutex;

use ember_common::{SystemSampler, SystemStats};

/// Samples host-wide CPU, memory and disk usage for the periodic system
/// stats report. CPU needs two refreshes a short interval apart, so the
/// `System` is kept behind a mutex across calls.
pub struct HostSampler {
    sys: Mutex<System>,
}

impl HostSampler {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }

    async fn sample_now(&self) -> SystemStats {
        let mut sys = self.sys.lock().await;
        sys.refresh_cpu_usage();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu_percent = sys.global_cpu_info().cpu_usage() as f64;
        let memory_total = sys.total_memory();
        let memory_used = sys.used_memory();
        let memory_percent = if memory_total > 0 {
            memory_used as f64 / memory_total as f64 * 100.0
        } else {
            0.0
        };

        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
            .or_else(|| disks.iter().next());
        let (disk_total, disk_used) = match root {
            Some(d) => (d.total_space(), d.total_space() - d.available_space()),
            None => (0, 0),
        };
        let disk_percent = if disk_total > 0 {
            disk_used as f64 / disk_total as f64 * 100.0
        } else {
            0.0
        };

        SystemStats {
            cpu_percent,
            memory_used,
            memory_total,
            memory_percent,
            disk_used,
            disk_total,
            disk_percent,
        }
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemSampler for HostSampler {
    async fn sample(&self) -> SystemStats {
        self.sample_now().await
    }
}
