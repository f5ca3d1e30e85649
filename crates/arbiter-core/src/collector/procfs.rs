//! Per-process sampling from `/proc/<pid>/`.
//!
//! Process cputime is cumulative in jiffies; the sampler also records the
//! system-wide cputime at the same moment so a snapshot pair can be turned
//! into a percent-of-core rate. Memory is VmRSS (+ VmSwap) from status, or
//! the proportional-share Pss from smaps when the `pss` option is set;
//! reading smaps requires CAP_SYS_PTRACE or root.

use crate::collector::cgroup::SampleError;
use crate::collector::sampler::ProcSnapshot;
use crate::collector::traits::FileSystem;
use crate::hostfacts::{self, CLK_TCK};
use std::io;
use std::path::Path;

/// Samples processes from a proc filesystem root.
#[derive(Debug, Clone)]
pub struct ProcSampler<F: FileSystem> {
    fs: F,
    proc_path: String,
}

impl<F: FileSystem> ProcSampler<F> {
    pub fn new(fs: F, proc_path: impl Into<String>) -> Self {
        Self {
            fs,
            proc_path: proc_path.into(),
        }
    }

    fn read(&self, pid: i32, file: &str) -> Result<String, SampleError> {
        let path = format!("{}/{}/{}", self.proc_path, pid, file);
        self.fs.read_to_string(Path::new(&path)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SampleError::Disappeared,
            io::ErrorKind::PermissionDenied => SampleError::Denied(path),
            _ => SampleError::Io(e),
        })
    }

    /// Takes one instantaneous snapshot of a process.
    pub fn sample(&self, pid: i32, pss: bool, include_swap: bool) -> Result<ProcSnapshot, SampleError> {
        let status = self.read(pid, "status")?;
        let name = status_field(&status, "Name").unwrap_or_default();
        let owner_uid = status_field(&status, "Uid")
            .and_then(|line| {
                // Uid line holds real, effective, saved, fs; take effective.
                line.split_whitespace().nth(1).map(str::to_string)
            })
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let mem_bytes = if pss {
            self.pss_bytes(pid, include_swap)?
        } else {
            let rss_kb = status_kb(&status, "VmRSS");
            let swap_kb = if include_swap {
                status_kb(&status, "VmSwap")
            } else {
                0
            };
            (rss_kb + swap_kb) * 1024
        };

        let stat = self.read(pid, "stat")?;
        let (cputime_ticks, starttime_ticks) = parse_stat_times(&stat)?;

        let uptime_s = self.machine_uptime()? - starttime_ticks as f64 / CLK_TCK as f64;
        let total_clockticks = hostfacts::total_clockticks(&self.fs, &self.proc_path)
            .map_err(SampleError::Io)?;

        Ok(ProcSnapshot {
            pid,
            name,
            owner_uid,
            uptime_s: uptime_s.max(0.0),
            cputime_ticks,
            mem_bytes,
            total_clockticks,
        })
    }

    /// Proportional-share memory from /proc/<pid>/smaps, in bytes.
    fn pss_bytes(&self, pid: i32, include_swap: bool) -> Result<u64, SampleError> {
        let smaps = self.read(pid, "smaps")?;
        let mut total_kb = 0u64;
        for line in smaps.lines() {
            let counted = line.starts_with("Pss:")
                || (include_swap && line.starts_with("SwapPss:"));
            if counted
                && let Some(value) = line.split_whitespace().nth(1)
                && let Ok(kb) = value.parse::<u64>()
            {
                total_kb += kb;
            }
        }
        Ok(total_kb * 1024)
    }

    /// Machine uptime in seconds from /proc/uptime.
    fn machine_uptime(&self) -> Result<f64, SampleError> {
        let path = format!("{}/uptime", self.proc_path);
        let uptime = self
            .fs
            .read_to_string(Path::new(&path))
            .map_err(SampleError::Io)?;
        uptime
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| SampleError::Parse(format!("uptime: {uptime}")))
    }
}

/// Extracts the value of a `Key:\tvalue` line from /proc/<pid>/status.
fn status_field(status: &str, key: &str) -> Option<String> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix(key)
            && let Some(value) = rest.strip_prefix(':')
        {
            return Some(value.trim().to_string());
        }
    }
    None
}

/// Extracts a `kB` field from /proc/<pid>/status, defaulting to 0.
fn status_kb(status: &str, key: &str) -> u64 {
    status_field(status, key)
        .and_then(|v| v.trim_end_matches(" kB").trim().parse().ok())
        .unwrap_or(0)
}

/// Returns (utime + stime, starttime) from /proc/<pid>/stat. The comm field
/// may contain spaces and parentheses, so parsing starts after the closing
/// paren.
fn parse_stat_times(stat: &str) -> Result<(u64, u64), SampleError> {
    let after_comm = stat
        .rfind(')')
        .map(|i| &stat[i + 1..])
        .ok_or_else(|| SampleError::Parse("stat: missing comm".into()))?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // Field numbering per proc(5): utime is field 14, stime 15, starttime 22.
    // after_comm starts at field 3 (state).
    let utime: u64 = parse_field(&fields, 14)?;
    let stime: u64 = parse_field(&fields, 15)?;
    let starttime: u64 = parse_field(&fields, 22)?;
    Ok((utime + stime, starttime))
}

fn parse_field(fields: &[&str], number: usize) -> Result<u64, SampleError> {
    fields
        .get(number - 3)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| SampleError::Parse(format!("stat: field {number}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    #[test]
    fn samples_process_counters() {
        let fs = MockFs::small_host();
        fs.add_process(42, "stress", 1000, 250, 2048);
        let sampler = ProcSampler::new(fs, "/proc");
        let snap = sampler.sample(42, false, false).unwrap();
        assert_eq!(snap.name, "stress");
        assert_eq!(snap.owner_uid, 1000);
        assert_eq!(snap.cputime_ticks, 250);
        assert_eq!(snap.mem_bytes, 2048 * 1024);
        assert_eq!(snap.total_clockticks, 10000);
        // starttime 100 ticks = 1s after boot, machine up 5000s.
        assert!((snap.uptime_s - 4999.0).abs() < 1e-6);
    }

    #[test]
    fn vanished_process_is_disappeared() {
        let fs = MockFs::small_host();
        let sampler = ProcSampler::new(fs, "/proc");
        assert!(matches!(
            sampler.sample(4242, false, false),
            Err(SampleError::Disappeared)
        ));
    }

    #[test]
    fn unreadable_smaps_is_denied() {
        let fs = MockFs::small_host();
        fs.add_process(42, "stress", 1000, 0, 0);
        fs.deny_reads("/proc/42/smaps");
        let sampler = ProcSampler::new(fs, "/proc");
        assert!(matches!(
            sampler.sample(42, true, false),
            Err(SampleError::Denied(_))
        ));
    }

    #[test]
    fn pss_sums_smaps_entries() {
        let fs = MockFs::small_host();
        fs.add_process(42, "stress", 1000, 0, 0);
        fs.add_file(
            "/proc/42/smaps",
            "Pss:      100 kB\nPrivate_Clean: 5 kB\nPss:      50 kB\nSwapPss:  10 kB\n",
        );
        let sampler = ProcSampler::new(fs, "/proc");
        assert_eq!(sampler.sample(42, true, false).unwrap().mem_bytes, 150 * 1024);
        assert_eq!(sampler.sample(42, true, true).unwrap().mem_bytes, 160 * 1024);
    }

    #[test]
    fn stat_with_spaced_comm_parses() {
        let mut fields = vec!["0"; 52];
        fields[13] = "7";
        fields[14] = "3";
        fields[21] = "500";
        let stat = format!("42 (Web Content) {}", fields[2..].join(" "));
        let (cputime, starttime) = parse_stat_times(&stat).unwrap();
        assert_eq!(cputime, 10);
        assert_eq!(starttime, 500);
    }
}
