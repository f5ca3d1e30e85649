//! Rate derivation from paired snapshots.
//!
//! Cgroup and process counters are cumulative, so usage cannot be read
//! directly: two `Instantaneous` snapshots taken at different monotonic
//! times are differenced into one rate-based `Averaged` record. Multiple
//! `Averaged` records add pointwise and divide by a scalar to average,
//! which is how the collector folds `poll - 1` pairs into one record per
//! refresh tick.

use crate::hostfacts::HostFacts;
use std::collections::BTreeSet;
use std::time::Instant;

/// Synthetic pid carrying the residual of cgroup usage minus the sum of
/// sampled processes.
pub const OTHER_PROCESSES_PID: i32 = -1;

/// Display label of the residual entry.
pub const OTHER_PROCESSES_LABEL: &str = "other processes";

/// A cpu/mem usage pair. Cpu is percent of one core; mem is percent of
/// total machine memory.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Usage {
    pub cpu: f64,
    pub mem: f64,
}

impl Usage {
    pub fn new(cpu: f64, mem: f64) -> Self {
        Self { cpu, mem }
    }

    pub fn add(self, other: Usage) -> Usage {
        Usage::new(self.cpu + other.cpu, self.mem + other.mem)
    }

    pub fn sub(self, other: Usage) -> Usage {
        Usage::new(self.cpu - other.cpu, self.mem - other.mem)
    }

    pub fn scale(self, by: f64) -> Usage {
        Usage::new(self.cpu * by, self.mem * by)
    }

    /// Clamps both resources at zero from below.
    pub fn clamp_floor(self) -> Usage {
        Usage::new(self.cpu.max(0.0), self.mem.max(0.0))
    }

    pub fn total(self) -> f64 {
        self.cpu + self.mem
    }

    /// Averages a slice of usages; empty input averages to zero.
    pub fn average(usages: &[Usage]) -> Usage {
        if usages.is_empty() {
            return Usage::default();
        }
        usages
            .iter()
            .fold(Usage::default(), |acc, u| acc.add(*u))
            .scale(1.0 / usages.len() as f64)
    }
}

/// What a cgroup-level sample refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A single user's `user-<uid>.slice`.
    User(u32),
    /// The union-of-users `user.slice`.
    Aggregate,
    /// Any other named cgroup below a parent, for tooling.
    Arbitrary { name: String, parent: String },
}

/// One instantaneous reading of a cgroup's cumulative counters.
#[derive(Debug, Clone)]
pub struct Instantaneous {
    pub taken_at: Instant,
    /// Cumulative cputime over all cores, nanoseconds.
    pub cputime_ns: u64,
    /// Current memory charge in bytes per the memory.stat policy.
    pub mem_bytes: u64,
    pub pids: Vec<i32>,
}

/// One instantaneous reading of a process's counters.
#[derive(Debug, Clone)]
pub struct ProcSnapshot {
    pub pid: i32,
    pub name: String,
    pub owner_uid: u32,
    pub uptime_s: f64,
    /// Cumulative utime + stime in jiffies.
    pub cputime_ticks: u64,
    pub mem_bytes: u64,
    /// System-wide cumulative cputime in jiffies at sample time.
    pub total_clockticks: u64,
}

/// A rate-based record derived from a snapshot pair.
#[derive(Debug, Clone, Default)]
pub struct Averaged {
    pub usage: Usage,
    pub pids: Vec<i32>,
}

impl Averaged {
    pub fn add(mut self, other: &Averaged) -> Averaged {
        self.usage = self.usage.add(other.usage);
        let set: BTreeSet<i32> = self.pids.iter().chain(other.pids.iter()).copied().collect();
        self.pids = set.into_iter().collect();
        self
    }

    pub fn scale(mut self, by: f64) -> Averaged {
        self.usage = self.usage.scale(by);
        self
    }
}

/// A rate-based record for a single process, possibly merged over several
/// like-named processes.
#[derive(Debug, Clone)]
pub struct StaticProcess {
    pub pid: i32,
    pub name: String,
    pub owner_uid: u32,
    pub uptime_s: f64,
    /// Number of records merged into this one.
    pub count: u32,
    pub usage: Usage,
}

impl StaticProcess {
    /// The residual record carrying usage not attributed to any sampled pid.
    pub fn other_processes(owner_uid: u32, usage: Usage) -> Self {
        Self {
            pid: OTHER_PROCESSES_PID,
            name: format!("{OTHER_PROCESSES_LABEL}**"),
            owner_uid,
            uptime_s: 0.0,
            count: 1,
            usage,
        }
    }

    /// Adds usage and count; keeps the longer uptime.
    pub fn add(mut self, other: &StaticProcess) -> StaticProcess {
        self.usage = self.usage.add(other.usage);
        self.count += other.count;
        self.uptime_s = self.uptime_s.max(other.uptime_s);
        self
    }

    /// Divides usage by a scalar; count rounds up.
    pub fn scale_down(mut self, by: u32) -> StaticProcess {
        let by = by.max(1);
        self.usage = self.usage.scale(1.0 / by as f64);
        self.count = self.count.div_ceil(by);
        self
    }
}

/// Differences two cgroup snapshots into a rate record.
///
/// If the cumulative cputime decreased, the cgroup was recreated between
/// samples and both metrics are zeroed rather than reporting garbage.
pub fn rate_between(older: &Instantaneous, newer: &Instantaneous, facts: &HostFacts) -> Averaged {
    let pids: BTreeSet<i32> = older.pids.iter().chain(newer.pids.iter()).copied().collect();
    let pids: Vec<i32> = pids.into_iter().collect();

    if older.cputime_ns > newer.cputime_ns {
        return Averaged {
            usage: Usage::default(),
            pids,
        };
    }

    let elapsed = newer.taken_at.duration_since(older.taken_at).as_secs_f64();
    let cpu = if elapsed > 0.0 {
        (newer.cputime_ns - older.cputime_ns) as f64 / elapsed / 1e9 * 100.0
    } else {
        0.0
    };
    let mem = (newer.mem_bytes + older.mem_bytes) as f64 / 2.0 / facts.total_mem_bytes as f64
        * 100.0;

    Averaged {
        usage: Usage::new(cpu, mem),
        pids,
    }
}

/// Differences two process snapshots into a rate record.
///
/// A cputime decrease or a name change means the pid was reused; both
/// metrics are zeroed in that case.
pub fn proc_rate_between(
    older: &ProcSnapshot,
    newer: &ProcSnapshot,
    facts: &HostFacts,
) -> StaticProcess {
    let usage = if older.cputime_ticks > newer.cputime_ticks || older.name != newer.name {
        Usage::default()
    } else {
        let tick_delta = newer
            .total_clockticks
            .abs_diff(older.total_clockticks)
            .max(1);
        let cpu = (newer.cputime_ticks - older.cputime_ticks) as f64 / tick_delta as f64
            * facts.cpu_count as f64
            * 100.0;
        let mem = (newer.mem_bytes + older.mem_bytes) as f64 / 2.0
            / facts.total_mem_bytes as f64
            * 100.0;
        Usage::new(cpu.max(0.0), mem)
    };

    StaticProcess {
        pid: older.pid,
        name: older.name.clone(),
        owner_uid: older.owner_uid,
        uptime_s: older.uptime_s.max(newer.uptime_s),
        count: 1,
        usage,
    }
}

/// Folds consecutive snapshots pairwise with `pair` and averages the
/// results with `add`/`scale`; returns None with fewer than two snapshots.
pub fn combine_averaged(snapshots: &[Instantaneous], facts: &HostFacts) -> Option<Averaged> {
    if snapshots.len() < 2 {
        return None;
    }
    let pairs = snapshots.len() - 1;
    let mut acc = Averaged::default();
    for pair in snapshots.windows(2) {
        acc = acc.add(&rate_between(&pair[0], &pair[1], facts));
    }
    Some(acc.scale(1.0 / pairs as f64))
}

/// Same folding for process snapshots.
pub fn combine_processes(snapshots: &[ProcSnapshot], facts: &HostFacts) -> Option<StaticProcess> {
    if snapshots.len() < 2 {
        return None;
    }
    let pairs = (snapshots.len() - 1) as u32;
    let mut iter = snapshots.windows(2);
    let first = iter.next()?;
    let mut acc = proc_rate_between(&first[0], &first[1], facts);
    for pair in iter {
        acc = acc.add(&proc_rate_between(&pair[0], &pair[1], facts));
    }
    Some(acc.scale_down(pairs))
}

/// Merges like-named process records, summing usage and counts. Used when
/// building the top-processes table for notifications.
pub fn merge_by_name(procs: &[StaticProcess]) -> Vec<StaticProcess> {
    let mut merged: Vec<StaticProcess> = Vec::new();
    for proc in procs {
        if let Some(existing) = merged.iter_mut().find(|p| p.name == proc.name) {
            *existing = existing.clone().add(proc);
        } else {
            merged.push(proc.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn facts() -> HostFacts {
        HostFacts {
            hostname: "node1".to_string(),
            total_mem_bytes: 8 * 1024 * 1024 * 1024,
            total_swap_bytes: 0,
            cpu_count: 4,
            threads_per_core: 1,
        }
    }

    fn instant_pair(gap: Duration) -> (Instant, Instant) {
        let start = Instant::now();
        (start, start + gap)
    }

    #[test]
    fn cgroup_rate_from_pair() {
        let facts = facts();
        let (t0, t1) = instant_pair(Duration::from_secs(1));
        let older = Instantaneous {
            taken_at: t0,
            cputime_ns: 0,
            mem_bytes: 4 * 1024 * 1024 * 1024,
            pids: vec![10],
        };
        let newer = Instantaneous {
            taken_at: t1,
            cputime_ns: 1_500_000_000,
            mem_bytes: 4 * 1024 * 1024 * 1024,
            pids: vec![10, 11],
        };
        let avg = rate_between(&older, &newer, &facts);
        assert!((avg.usage.cpu - 150.0).abs() < 1.0);
        assert!((avg.usage.mem - 50.0).abs() < 0.1);
        assert_eq!(avg.pids, vec![10, 11]);
    }

    #[test]
    fn cgroup_recreation_zeroes_usage() {
        let facts = facts();
        let (t0, t1) = instant_pair(Duration::from_secs(1));
        let older = Instantaneous {
            taken_at: t0,
            cputime_ns: 5_000_000_000,
            mem_bytes: 1024,
            pids: vec![],
        };
        let newer = Instantaneous {
            taken_at: t1,
            cputime_ns: 1_000_000_000,
            mem_bytes: 1024,
            pids: vec![],
        };
        let avg = rate_between(&older, &newer, &facts);
        assert_eq!(avg.usage, Usage::default());
    }

    #[test]
    fn process_rate_scales_by_cpu_count() {
        let facts = facts();
        let older = ProcSnapshot {
            pid: 42,
            name: "stress".into(),
            owner_uid: 1000,
            uptime_s: 10.0,
            cputime_ticks: 0,
            mem_bytes: 0,
            total_clockticks: 0,
        };
        let newer = ProcSnapshot {
            cputime_ticks: 100,
            total_clockticks: 400,
            uptime_s: 11.0,
            ..older.clone()
        };
        let s = proc_rate_between(&older, &newer, &facts);
        // 100 of 400 jiffies over 4 cpus = one full core.
        assert!((s.usage.cpu - 100.0).abs() < 1e-9);
        assert!((s.uptime_s - 11.0).abs() < 1e-9);
    }

    #[test]
    fn pid_reuse_zeroes_usage() {
        let facts = facts();
        let older = ProcSnapshot {
            pid: 42,
            name: "stress".into(),
            owner_uid: 1000,
            uptime_s: 10.0,
            cputime_ticks: 50,
            mem_bytes: 0,
            total_clockticks: 100,
        };
        let renamed = ProcSnapshot {
            name: "bash".into(),
            cputime_ticks: 60,
            total_clockticks: 200,
            ..older.clone()
        };
        assert_eq!(proc_rate_between(&older, &renamed, &facts).usage, Usage::default());

        let rewound = ProcSnapshot {
            cputime_ticks: 10,
            ..older.clone()
        };
        assert_eq!(proc_rate_between(&older, &rewound, &facts).usage, Usage::default());
    }

    #[test]
    fn combine_averages_over_pairs() {
        let facts = facts();
        let start = Instant::now();
        let snaps: Vec<Instantaneous> = (0..3)
            .map(|i| Instantaneous {
                taken_at: start + Duration::from_secs(i),
                cputime_ns: i * 1_000_000_000,
                mem_bytes: 0,
                pids: vec![],
            })
            .collect();
        let avg = combine_averaged(&snaps, &facts).unwrap();
        assert!((avg.usage.cpu - 100.0).abs() < 1.0);
        assert!(combine_averaged(&snaps[..1], &facts).is_none());
    }

    #[test]
    fn merge_by_name_sums_counts() {
        let a = StaticProcess {
            pid: 1,
            name: "make".into(),
            owner_uid: 0,
            uptime_s: 5.0,
            count: 1,
            usage: Usage::new(10.0, 1.0),
        };
        let b = StaticProcess {
            pid: 2,
            uptime_s: 9.0,
            ..a.clone()
        };
        let merged = merge_by_name(&[a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].count, 2);
        assert!((merged[0].usage.cpu - 20.0).abs() < 1e-9);
        assert!((merged[0].uptime_s - 9.0).abs() < 1e-9);
    }
}
