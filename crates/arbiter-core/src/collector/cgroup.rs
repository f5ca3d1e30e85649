//! Cgroup (v1) adapter: reads cumulative counters and reads/writes quotas
//! for `user-<uid>.slice` cgroups under the systemd hierarchy.
//!
//! Memory reading policy: usage is the sum of `total_rss` and
//! `total_mapped_file` from `memory.stat`, plus `total_swap` when memsw
//! accounting is on. The raw `memory.usage_in_bytes` value is not used; it
//! includes page cache and is fuzzily coalesced across cores.

use crate::collector::sampler::{Instantaneous, Target};
use crate::collector::traits::FileSystem;
use crate::hostfacts::HostFacts;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// The controller used to check whether a cgroup exists and to get pids.
const DEFAULT_CONTROLLER: &str = "systemd";

/// Error type for sampling and quota operations.
#[derive(Debug)]
pub enum SampleError {
    /// The entity's cgroup directory (or the pid) vanished mid-read.
    Disappeared,
    /// Insufficient privilege to read or write the file.
    Denied(String),
    /// A counter file held something unparsable.
    Parse(String),
    /// Any other I/O failure.
    Io(io::Error),
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleError::Disappeared => write!(f, "entity disappeared during sampling"),
            SampleError::Denied(path) => write!(f, "permission denied: {}", path),
            SampleError::Parse(msg) => write!(f, "parse error: {}", msg),
            SampleError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for SampleError {}

impl SampleError {
    fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => SampleError::Disappeared,
            io::ErrorKind::PermissionDenied => SampleError::Denied(path.display().to_string()),
            _ => SampleError::Io(err),
        }
    }
}

/// Typed access to the cgroup v1 surface.
#[derive(Debug, Clone)]
pub struct CgroupAdapter<F: FileSystem> {
    fs: F,
    base_path: String,
}

impl<F: FileSystem> CgroupAdapter<F> {
    /// Default mount point of the cgroup v1 hierarchy.
    pub const DEFAULT_BASE: &'static str = "/sys/fs/cgroup";

    pub fn new(fs: F, base_path: impl Into<String>) -> Self {
        Self {
            fs,
            base_path: base_path.into(),
        }
    }

    /// Path to `cgfile` for `target` under `controller`.
    fn path(&self, controller: &str, target: &Target, cgfile: &str) -> PathBuf {
        let mut parts = vec![self.base_path.as_str(), controller];
        let name;
        match target {
            Target::User(uid) => {
                name = format!("user-{uid}.slice");
                parts.push("user.slice");
                parts.push(&name);
            }
            Target::Aggregate => parts.push("user.slice"),
            Target::Arbitrary { name, parent } => {
                if !parent.is_empty() {
                    parts.push(parent);
                }
                parts.push(name);
            }
        }
        if !cgfile.is_empty() {
            parts.push(cgfile);
        }
        PathBuf::from(parts.join("/"))
    }

    fn read(&self, controller: &str, target: &Target, cgfile: &str) -> Result<String, SampleError> {
        let path = self.path(controller, target, cgfile);
        self.fs
            .read_to_string(&path)
            .map_err(|e| SampleError::from_io(e, &path))
    }

    fn write(&self, controller: &str, target: &Target, cgfile: &str, value: &str) -> Result<(), SampleError> {
        let path = self.path(controller, target, cgfile);
        self.fs
            .write(&path, value)
            .map_err(|e| SampleError::from_io(e, &path))
    }

    /// Returns whether the target currently exists in the hierarchy.
    pub fn active(&self, target: &Target) -> bool {
        self.fs.exists(&self.path(DEFAULT_CONTROLLER, target, ""))
    }

    /// Lists uids with an active cgroup, at or above `min_uid`.
    pub fn list_active_uids(&self, min_uid: u32) -> Vec<u32> {
        let parent = self.path(DEFAULT_CONTROLLER, &Target::Aggregate, "");
        let mut uids = Vec::new();
        let Ok(entries) = self.fs.read_dir(&parent) else {
            return uids;
        };
        for entry in entries {
            let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(uid) = name
                .strip_prefix("user-")
                .and_then(|rest| rest.strip_suffix(".slice"))
                .and_then(|digits| digits.parse::<u32>().ok())
                && uid >= min_uid
            {
                uids.push(uid);
            }
        }
        uids.sort_unstable();
        uids
    }

    /// Current pids in the target's cgroup. For user slices with
    /// session-per-user setups the pids of every `*.scope` child are
    /// included as well.
    pub fn pids(&self, target: &Target) -> Result<Vec<i32>, SampleError> {
        let mut pids = parse_pids(&self.read(DEFAULT_CONTROLLER, target, "cgroup.procs")?);

        let top = self.path(DEFAULT_CONTROLLER, target, "");
        if let Ok(entries) = self.fs.read_dir(&top) {
            for entry in entries {
                let is_scope = entry
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".scope"));
                if is_scope
                    && let Ok(content) = self.fs.read_to_string(&entry.join("cgroup.procs"))
                {
                    pids.extend(parse_pids(&content));
                }
            }
        }
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    /// Cumulative cputime of the target over all cores, in nanoseconds.
    pub fn cputime_ns(&self, target: &Target) -> Result<u64, SampleError> {
        let percpu = self.read("cpu", target, "cpuacct.usage_percpu")?;
        let mut total = 0u64;
        for value in percpu.split_whitespace() {
            total += value
                .parse::<u64>()
                .map_err(|_| SampleError::Parse(format!("cpuacct.usage_percpu: {value}")))?;
        }
        Ok(total)
    }

    /// Memory charged to the target in bytes per the memory.stat policy.
    pub fn mem_bytes(&self, target: &Target, memsw: bool) -> Result<u64, SampleError> {
        let stat = self.read("memory", target, "memory.stat")?;
        let mut total = 0u64;
        for line in stat.lines() {
            let Some((key, value)) = line.split_once(' ') else {
                continue;
            };
            let counted = matches!(key, "total_rss" | "total_mapped_file")
                || (memsw && key == "total_swap");
            if counted {
                total += value
                    .parse::<u64>()
                    .map_err(|_| SampleError::Parse(format!("memory.stat {key}: {value}")))?;
            }
        }
        Ok(total)
    }

    /// Takes one instantaneous snapshot of the target's counters.
    pub fn sample(&self, target: &Target, memsw: bool) -> Result<Instantaneous, SampleError> {
        Ok(Instantaneous {
            taken_at: Instant::now(),
            cputime_ns: self.cputime_ns(target)?,
            mem_bytes: self.mem_bytes(target, memsw)?,
            pids: self.pids(target)?,
        })
    }

    /// Current CPU quota as percent of one core. -1 means unlimited.
    pub fn cpu_quota(&self, target: &Target) -> Result<f64, SampleError> {
        let quota: f64 = parse_number(&self.read("cpuacct", target, "cpu.cfs_quota_us")?)?;
        let period: f64 = parse_number(&self.read("cpuacct", target, "cpu.cfs_period_us")?)?;
        Ok(quota / period * 100.0)
    }

    /// Current memory quota in bytes.
    pub fn mem_quota_bytes(&self, target: &Target, memsw: bool) -> Result<u64, SampleError> {
        let file = if memsw {
            "memory.memsw.limit_in_bytes"
        } else {
            "memory.limit_in_bytes"
        };
        parse_number(&self.read("memory", target, file)?)
    }

    /// Sets the CPU quota as a percent of one core, scaled by the period.
    pub fn set_cpu_quota(&self, target: &Target, pct_of_core: f64) -> Result<(), SampleError> {
        let period: f64 = parse_number(&self.read("cpuacct", target, "cpu.cfs_period_us")?)?;
        let quota = (pct_of_core / 100.0 * period) as i64;
        self.write("cpuacct", target, "cpu.cfs_quota_us", &quota.to_string())
    }

    /// Sets the memory quota as a percent of total machine memory.
    ///
    /// With memsw the write order depends on direction: raising the limit
    /// writes the combined file first, lowering writes the main file first
    /// (the kernel requires limit <= memsw limit at all times). A failure
    /// of the first write surfaces as an error so the enforcer can scale;
    /// a failure of the second write is logged and swallowed, since the
    /// kernel may legitimately reject it until usage drains.
    pub fn set_mem_quota(
        &self,
        target: &Target,
        pct_of_total: f64,
        memsw: bool,
        facts: &HostFacts,
    ) -> Result<(), SampleError> {
        let raw_quota = facts.pct_to_bytes(pct_of_total);
        let mut files = vec!["memory.limit_in_bytes"];
        if memsw {
            let current = self.mem_quota_bytes(target, true)?;
            if raw_quota >= current {
                files.insert(0, "memory.memsw.limit_in_bytes");
            } else {
                files.push("memory.memsw.limit_in_bytes");
            }
        }
        for (index, file) in files.iter().enumerate() {
            match self.write("memory", target, file, &raw_quota.to_string()) {
                Ok(()) => {}
                Err(err) if index == 0 => return Err(err),
                Err(err) => {
                    tracing::warn!(file = %file, error = %err, "secondary memory limit write failed");
                }
            }
        }
        Ok(())
    }
}

fn parse_pids(content: &str) -> Vec<i32> {
    content
        .lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .collect()
}

fn parse_number<T: std::str::FromStr>(content: &str) -> Result<T, SampleError> {
    content
        .trim()
        .parse()
        .map_err(|_| SampleError::Parse(format!("unexpected number: {}", content.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    fn facts() -> HostFacts {
        HostFacts {
            hostname: "node1".into(),
            total_mem_bytes: 8 * 1024 * 1024 * 1024,
            total_swap_bytes: 0,
            cpu_count: 4,
            threads_per_core: 1,
        }
    }

    #[test]
    fn lists_active_uids_above_min() {
        let fs = MockFs::new();
        fs.add_user_slice(999, 0, 0, &[]);
        fs.add_user_slice(1000, 0, 0, &[1]);
        fs.add_user_slice(1001, 0, 0, &[2]);
        let adapter = CgroupAdapter::new(fs, CgroupAdapter::<MockFs>::DEFAULT_BASE);
        assert_eq!(adapter.list_active_uids(1000), vec![1000, 1001]);
        assert_eq!(adapter.list_active_uids(0), vec![999, 1000, 1001]);
    }

    #[test]
    fn samples_user_counters() {
        let fs = MockFs::new();
        fs.add_user_slice(1000, 3_000_000_000, 1024 * 1024, &[41, 42]);
        let adapter = CgroupAdapter::new(fs, CgroupAdapter::<MockFs>::DEFAULT_BASE);
        let snap = adapter.sample(&Target::User(1000), false).unwrap();
        assert_eq!(snap.cputime_ns, 3_000_000_000);
        assert_eq!(snap.mem_bytes, 1024 * 1024);
        assert_eq!(snap.pids, vec![41, 42]);
    }

    #[test]
    fn includes_session_scope_pids() {
        let fs = MockFs::new();
        fs.add_user_slice(1000, 0, 0, &[10]);
        fs.add_file(
            "/sys/fs/cgroup/systemd/user.slice/user-1000.slice/session-3.scope/cgroup.procs",
            "20\n21\n",
        );
        let adapter = CgroupAdapter::new(fs, CgroupAdapter::<MockFs>::DEFAULT_BASE);
        assert_eq!(adapter.pids(&Target::User(1000)).unwrap(), vec![10, 20, 21]);
    }

    #[test]
    fn vanished_cgroup_is_disappeared() {
        let fs = MockFs::new();
        let adapter = CgroupAdapter::new(fs, CgroupAdapter::<MockFs>::DEFAULT_BASE);
        assert!(matches!(
            adapter.sample(&Target::User(4242), false),
            Err(SampleError::Disappeared)
        ));
    }

    #[test]
    fn unreadable_file_is_denied() {
        let fs = MockFs::new();
        fs.add_user_slice(1000, 0, 0, &[]);
        fs.deny_reads("/sys/fs/cgroup/cpu/user.slice/user-1000.slice/cpuacct.usage_percpu");
        let adapter = CgroupAdapter::new(fs, CgroupAdapter::<MockFs>::DEFAULT_BASE);
        assert!(matches!(
            adapter.sample(&Target::User(1000), false),
            Err(SampleError::Denied(_))
        ));
    }

    #[test]
    fn memsw_counts_swap() {
        let fs = MockFs::new();
        fs.add_user_slice(1000, 0, 0, &[]);
        fs.add_file(
            "/sys/fs/cgroup/memory/user.slice/user-1000.slice/memory.stat",
            "total_cache 100\ntotal_rss 1000\ntotal_mapped_file 200\ntotal_swap 50\n",
        );
        let adapter = CgroupAdapter::new(fs, CgroupAdapter::<MockFs>::DEFAULT_BASE);
        assert_eq!(adapter.mem_bytes(&Target::User(1000), false).unwrap(), 1200);
        assert_eq!(adapter.mem_bytes(&Target::User(1000), true).unwrap(), 1250);
    }

    #[test]
    fn cpu_quota_roundtrip() {
        let fs = MockFs::new();
        fs.add_user_slice(1000, 0, 0, &[]);
        let adapter = CgroupAdapter::new(fs.clone(), CgroupAdapter::<MockFs>::DEFAULT_BASE);
        adapter.set_cpu_quota(&Target::User(1000), 150.0).unwrap();
        assert_eq!(
            fs.content("/sys/fs/cgroup/cpuacct/user.slice/user-1000.slice/cpu.cfs_quota_us")
                .unwrap(),
            "150000"
        );
        assert!((adapter.cpu_quota(&Target::User(1000)).unwrap() - 150.0).abs() < 1e-9);
    }

    #[test]
    fn mem_quota_write_order_depends_on_direction() {
        let fs = MockFs::new();
        fs.add_user_slice(1000, 0, 0, &[]);
        let facts = facts();
        let adapter = CgroupAdapter::new(fs.clone(), CgroupAdapter::<MockFs>::DEFAULT_BASE);

        // Lowering: main limit first; a failing second (memsw) write is
        // swallowed and the main limit stays applied.
        fs.fail_next_writes(
            "/sys/fs/cgroup/memory/user.slice/user-1000.slice/memory.memsw.limit_in_bytes",
            1,
        );
        assert!(
            adapter
                .set_mem_quota(&Target::User(1000), 50.0, true, &facts)
                .is_ok()
        );
        assert_eq!(
            fs.content("/sys/fs/cgroup/memory/user.slice/user-1000.slice/memory.limit_in_bytes")
                .unwrap(),
            facts.pct_to_bytes(50.0).to_string()
        );

        // A failing first write surfaces so the enforcer can scale.
        fs.fail_next_writes(
            "/sys/fs/cgroup/memory/user.slice/user-1000.slice/memory.limit_in_bytes",
            1,
        );
        assert!(
            adapter
                .set_mem_quota(&Target::User(1000), 10.0, false, &facts)
                .is_err()
        );
    }
}
