//! Immutable system facts gathered once at boot.
//!
//! Total memory, swap, topology and the hostname are read from `/proc` a
//! single time and carried by value into every component, so a tick never
//! has to re-derive them and the hostname cannot change underneath the
//! synchronization logic.

use crate::collector::traits::FileSystem;
use std::fmt;
use std::path::Path;

/// Clock ticks per second (USER_HZ). Standard value for Linux.
pub const CLK_TCK: u64 = 100;

/// Error type for host fact detection failures.
#[derive(Debug)]
pub enum FactsError {
    /// A required /proc file could not be read.
    Io(std::io::Error),
    /// A /proc file did not contain an expected field.
    Missing(String),
}

impl fmt::Display for FactsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactsError::Io(e) => write!(f, "I/O error: {}", e),
            FactsError::Missing(field) => write!(f, "missing field: {}", field),
        }
    }
}

impl std::error::Error for FactsError {}

impl From<std::io::Error> for FactsError {
    fn from(e: std::io::Error) -> Self {
        FactsError::Io(e)
    }
}

/// System facts that hold for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct HostFacts {
    /// The machine's hostname; also the identity used in the status store.
    pub hostname: String,
    /// Total machine memory in bytes.
    pub total_mem_bytes: u64,
    /// Total swap in bytes.
    pub total_swap_bytes: u64,
    /// Online logical CPUs.
    pub cpu_count: u32,
    /// Hardware threads per physical core (1 without hyperthreading).
    pub threads_per_core: u32,
}

impl HostFacts {
    /// Reads the host facts from `/proc` files under `proc_path`.
    pub fn detect<F: FileSystem>(fs: &F, proc_path: &str) -> Result<Self, FactsError> {
        let hostname = fs
            .read_to_string(Path::new(&format!("{proc_path}/sys/kernel/hostname")))?
            .trim()
            .to_string();
        let meminfo = fs.read_to_string(Path::new(&format!("{proc_path}/meminfo")))?;
        let total_mem_bytes = meminfo_kb(&meminfo, "MemTotal")? * 1024;
        let total_swap_bytes = meminfo_kb(&meminfo, "SwapTotal").unwrap_or(0) * 1024;

        let cpuinfo = fs.read_to_string(Path::new(&format!("{proc_path}/cpuinfo")))?;
        let cpu_count = cpuinfo
            .lines()
            .filter(|l| l.starts_with("processor"))
            .count()
            .max(1) as u32;
        let threads_per_core = threads_per_core(&cpuinfo);

        Ok(Self {
            hostname,
            total_mem_bytes,
            total_swap_bytes,
            cpu_count,
            threads_per_core,
        })
    }

    /// Converts bytes to a percentage of total machine memory.
    pub fn bytes_to_pct(&self, bytes: u64) -> f64 {
        bytes as f64 / self.total_mem_bytes as f64 * 100.0
    }

    /// Converts a percentage of total machine memory to bytes.
    pub fn pct_to_bytes(&self, pct: f64) -> u64 {
        (self.total_mem_bytes as f64 * pct / 100.0) as u64
    }

    /// Converts a percentage of total machine memory to gigabytes.
    pub fn pct_to_gb(&self, pct: f64) -> f64 {
        pct / 100.0 * self.total_mem_bytes as f64 / 1024f64.powi(3)
    }

    /// Converts gigabytes to a percentage of total machine memory.
    pub fn gb_to_pct(&self, gb: f64) -> f64 {
        gb * 1024f64.powi(3) / self.total_mem_bytes as f64 * 100.0
    }
}

/// Extracts a `kB` field from /proc/meminfo content.
fn meminfo_kb(meminfo: &str, field: &str) -> Result<u64, FactsError> {
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix(field)
            && let Some(value) = rest.strip_prefix(':')
        {
            let number = value.trim().trim_end_matches(" kB").trim();
            return number
                .parse()
                .map_err(|_| FactsError::Missing(format!("unparsable {field}: {number}")));
        }
    }
    Err(FactsError::Missing(field.to_string()))
}

/// Derives threads-per-core from the `siblings` and `cpu cores` fields of
/// /proc/cpuinfo. Falls back to 1 when the fields are absent (e.g. VMs).
fn threads_per_core(cpuinfo: &str) -> u32 {
    let mut siblings = None;
    let mut cores = None;
    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "siblings" if siblings.is_none() => siblings = value.parse::<u32>().ok(),
            "cpu cores" if cores.is_none() => cores = value.parse::<u32>().ok(),
            _ => {}
        }
        if siblings.is_some() && cores.is_some() {
            break;
        }
    }
    match (siblings, cores) {
        (Some(s), Some(c)) if c > 0 && s >= c => s / c,
        _ => 1,
    }
}

/// Reads the system-wide cumulative cputime from the first line of
/// /proc/stat, in jiffies. Used by the process sampler to scale per-process
/// cputime deltas into core percentages.
pub fn total_clockticks<F: FileSystem>(fs: &F, proc_path: &str) -> std::io::Result<u64> {
    let stat = fs.read_to_string(Path::new(&format!("{proc_path}/stat")))?;
    let first = stat.lines().next().unwrap_or("");
    Ok(first
        .strip_prefix("cpu")
        .unwrap_or("")
        .split_whitespace()
        .filter_map(|v| v.parse::<u64>().ok())
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    #[test]
    fn detect_small_host() {
        let fs = MockFs::small_host();
        let facts = HostFacts::detect(&fs, "/proc").unwrap();
        assert_eq!(facts.hostname, "node1");
        assert_eq!(facts.total_mem_bytes, 8 * 1024 * 1024 * 1024);
        assert_eq!(facts.total_swap_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(facts.cpu_count, 4);
        assert_eq!(facts.threads_per_core, 2);
    }

    #[test]
    fn pct_conversions_are_inverse() {
        let fs = MockFs::small_host();
        let facts = HostFacts::detect(&fs, "/proc").unwrap();
        let pct = facts.gb_to_pct(2.0);
        assert!((facts.pct_to_gb(pct) - 2.0).abs() < 1e-9);
        assert_eq!(facts.pct_to_bytes(50.0), 4 * 1024 * 1024 * 1024);
    }

    #[test]
    fn threads_per_core_defaults_to_one() {
        assert_eq!(threads_per_core("processor : 0\n"), 1);
    }

    #[test]
    fn total_clockticks_sums_first_line() {
        let fs = MockFs::small_host();
        assert_eq!(total_clockticks(&fs, "/proc").unwrap(), 10000);
    }
}
