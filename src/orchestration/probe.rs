//! System resource probing.
//!
//! The health monitor and resource manager read host metrics through
//! [`SystemProbe`] so production code can use `sysinfo` while tests inject
//! fixed values.

use parking_lot::Mutex;
use sysinfo::{Disks, Networks, System};

/// One reading of host-level resource usage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

impl Default for ResourceSample {
    fn default() -> Self {
        Self {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            disk_usage: 0.0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
        }
    }
}

pub trait SystemProbe: Send + Sync + 'static {
    fn sample(&self) -> ResourceSample;
}

/// Production probe backed by `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
    disks: Mutex<Disks>,
    networks: Mutex<Networks>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_all()),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn sample(&self) -> ResourceSample {
        let (cpu_usage, memory_usage) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();
            let cpu = f64::from(system.global_cpu_info().cpu_usage());
            let memory = if system.total_memory() > 0 {
                system.used_memory() as f64 / system.total_memory() as f64 * 100.0
            } else {
                0.0
            };
            (cpu, memory)
        };

        let disk_usage = {
            let mut disks = self.disks.lock();
            disks.refresh();
            let (total, available) = disks
                .iter()
                .fold((0u64, 0u64), |(total, available), disk| {
                    (total + disk.total_space(), available + disk.available_space())
                });
            if total > 0 {
                (total - available) as f64 / total as f64 * 100.0
            } else {
                0.0
            }
        };

        let (network_rx_bytes, network_tx_bytes) = {
            let mut networks = self.networks.lock();
            networks.refresh();
            networks.iter().fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (rx + data.total_received(), tx + data.total_transmitted())
            })
        };

        ResourceSample {
            cpu_usage,
            memory_usage,
            disk_usage,
            network_rx_bytes,
            network_tx_bytes,
        }
    }
}

/// Fixed-value probe for tests and simulations.
#[derive(Default)]
pub struct StaticProbe {
    sample: Mutex<ResourceSample>,
}

impl StaticProbe {
    pub fn new(sample: ResourceSample) -> Self {
        Self {
            sample: Mutex::new(sample),
        }
    }

    pub fn set(&self, sample: ResourceSample) {
        *self.sample.lock() = sample;
    }
}

impl SystemProbe for StaticProbe {
    fn sample(&self) -> ResourceSample {
        *self.sample.lock()
    }
}
