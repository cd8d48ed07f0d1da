use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use serde::Serialize;
use sysinfo::{Disks, Networks, System, MINIMUM_CPU_UPDATE_INTERVAL};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuInfo {
    pub physical_cores: Option<usize>,
    pub frequency_mhz: u64,
    pub usage_percent: f32,
    /// One, five and fifteen minute load; `None` unless asked for.
    pub load_average: Option<[f64; 3]>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskInfo {
    pub mount_point: PathBuf,
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub percent: f64,
}

/// Average throughput in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NetSpeed {
    pub sent: f64,
    pub recv: f64,
}

impl fmt::Display for NetSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent {}, recv {}",
            format_rate(self.sent),
            format_rate(self.recv)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub disk: Option<DiskInfo>,
    pub network: Option<NetSpeed>,
}

/// Renders a byte rate with the largest unit that keeps the value under 1024.
pub fn format_rate(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    let mut value = bytes_per_sec.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{:.0}{}", value, UNITS[0])
    } else {
        format!("{:.2}{}", value, UNITS[unit])
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / total as f64
}

fn read_cpu(sys: &System, load_average: bool) -> CpuInfo {
    let load_average = load_average.then(|| {
        let load = System::load_average();
        [load.one, load.five, load.fifteen]
    });
    CpuInfo {
        physical_cores: sys.physical_core_count(),
        frequency_mhz: sys.cpus().first().map(|c| c.frequency()).unwrap_or(0),
        usage_percent: sys.global_cpu_info().cpu_usage(),
        load_average,
    }
}

/// Samples CPU usage over `sample`, which is raised to the minimum interval sysinfo needs.
pub fn cpu_info(sample: Duration, load_average: bool) -> CpuInfo {
    let mut sys = System::new();
    sys.refresh_cpu();
    thread::sleep(sample.max(MINIMUM_CPU_UPDATE_INTERVAL));
    sys.refresh_cpu();
    read_cpu(&sys, load_average)
}

pub fn memory_info() -> MemoryInfo {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    let used = sys.used_memory();
    MemoryInfo {
        total,
        available: sys.available_memory(),
        used,
        percent: percent(used, total),
    }
}

/// Usage of the filesystem mounted exactly at `mount_point`.
pub fn disk_info(mount_point: &Path) -> Option<DiskInfo> {
    let disks = Disks::new_with_refreshed_list();
    let disk = disks.list().iter().find(|d| d.mount_point() == mount_point)?;
    let total = disk.total_space();
    let free = disk.available_space();
    let used = total.saturating_sub(free);
    Some(DiskInfo {
        mount_point: mount_point.to_path_buf(),
        total,
        free,
        used,
        percent: percent(used, total),
    })
}

#[derive(Debug, Clone, Copy)]
struct NetSample {
    sent: u64,
    recv: u64,
    at: Instant,
}

fn speed_between(earlier: &NetSample, later: &NetSample) -> Option<NetSpeed> {
    let elapsed = later.at.checked_duration_since(earlier.at)?.as_secs_f64();
    if elapsed <= 0.0 {
        return None;
    }
    // Counters shrink when an interface goes away; report that as idle.
    Some(NetSpeed {
        sent: later.sent.saturating_sub(earlier.sent) as f64 / elapsed,
        recv: later.recv.saturating_sub(earlier.recv) as f64 / elapsed,
    })
}

/// Tracks total bytes across all interfaces between two `update` calls.
pub struct NetMonitor {
    networks: Networks,
    previous: Option<NetSample>,
    current: NetSample,
}

impl NetMonitor {
    pub fn new() -> Self {
        let networks = Networks::new_with_refreshed_list();
        let current = Self::sample(&networks);
        NetMonitor {
            networks,
            previous: None,
            current,
        }
    }

    fn sample(networks: &Networks) -> NetSample {
        let (sent, recv) = networks
            .iter()
            .fold((0u64, 0u64), |(sent, recv), (_, data)| {
                (
                    sent.saturating_add(data.total_transmitted()),
                    recv.saturating_add(data.total_received()),
                )
            });
        NetSample {
            sent,
            recv,
            at: Instant::now(),
        }
    }

    pub fn update(&mut self) {
        self.networks.refresh();
        let next = Self::sample(&self.networks);
        self.previous = Some(std::mem::replace(&mut self.current, next));
    }

    pub fn bytes_sent(&self) -> u64 {
        self.current.sent
    }

    pub fn bytes_recv(&self) -> u64 {
        self.current.recv
    }

    /// `None` until `update` has been called once.
    pub fn avg_speed(&self) -> Option<NetSpeed> {
        speed_between(self.previous.as_ref()?, &self.current)
    }
}

impl Default for NetMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// CPU, memory, root disk and network speed, sampled over one shared interval.
pub fn snapshot(sample: Duration) -> SystemStatus {
    let mut sys = System::new();
    sys.refresh_cpu();
    let mut net = NetMonitor::new();
    thread::sleep(sample.max(MINIMUM_CPU_UPDATE_INTERVAL));
    sys.refresh_cpu();
    net.update();

    let status = SystemStatus {
        cpu: read_cpu(&sys, true),
        memory: memory_info(),
        disk: disk_info(Path::new("/")),
        network: net.avg_speed(),
    };
    debug!(
        "cpu {:.1}%, memory {:.1}%",
        status.cpu.usage_percent, status.memory.percent
    );
    status
}
