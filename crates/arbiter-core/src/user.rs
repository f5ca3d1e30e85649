//! Per-user tracking state.
//!
//! A `User` is created the first time its cgroup is observed and dropped
//! once three things hold at the same time: the cgroup is inactive, the
//! badness is zero on every resource, and the status group is not a
//! penalty. History and badness history are bounded ring buffers.

use crate::badness::Badness;
use crate::collector::sampler::{StaticProcess, Usage, OTHER_PROCESSES_LABEL};
use crate::collector::traits::FileSystem;
use crate::config::CoreConfig;
use crate::status::Status;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;

/// One refresh tick's worth of averaged usage for a user.
#[derive(Debug, Clone, Default)]
pub struct RefreshEvent {
    /// Epoch seconds of the tick.
    pub time: i64,
    /// Averaged cgroup usage over the tick.
    pub usage: Usage,
    /// Processes observed at least twice during the tick, by pid. Pid -1
    /// is the synthetic residual entry.
    pub pids: HashMap<i32, StaticProcess>,
}

/// One badness update, kept for reporting.
#[derive(Debug, Clone, Copy)]
pub struct BadnessEvent {
    pub timestamp: i64,
    pub delta: Usage,
    pub badness: Badness,
}

/// A tracked user.
#[derive(Debug, Clone)]
pub struct User {
    pub uid: u32,
    /// Username from passwd; users without an entry are never tracked.
    pub username: String,
    /// "uid (username)", used in log lines.
    pub uid_name: String,
    pub gids: Vec<u32>,
    pub status: Status,
    /// Refresh events, most recent first.
    pub history: VecDeque<RefreshEvent>,
    /// Badness updates, most recent first.
    pub badness_history: VecDeque<BadnessEvent>,
    /// Average cgroup cpu usage over the refresh window, percent of core.
    pub cpu_usage: f64,
    /// Average cgroup mem usage over the refresh window, percent of machine.
    pub mem_usage: f64,
    /// Quota of the current status group, percent of core.
    pub cpu_quota: f64,
    /// Quota of the current status group, percent of machine.
    pub mem_quota: f64,
}

impl User {
    pub fn new(uid: u32, username: String, gids: Vec<u32>, status: Status, now: i64) -> Self {
        let uid_name = format!("{uid} ({username})");
        let mut user = Self {
            uid,
            username,
            uid_name,
            gids,
            status,
            history: VecDeque::new(),
            badness_history: VecDeque::new(),
            cpu_usage: 0.0,
            mem_usage: 0.0,
            cpu_quota: 0.0,
            mem_quota: 0.0,
        };
        user.set_badness(Badness::zero(now));
        user
    }

    /// Whether this user was created this tick (only the seed badness
    /// event exists). New users are eligible for badness import.
    pub fn is_new(&self) -> bool {
        self.badness_history.len() <= 1
    }

    /// Latest badness score.
    pub fn badness(&self) -> Badness {
        self.badness_history
            .front()
            .map(|e| e.badness)
            .unwrap_or(Badness::zero(0))
    }

    /// Replaces the badness history with a single event, as on creation or
    /// when importing a stored score.
    pub fn set_badness(&mut self, badness: Badness) {
        self.badness_history.clear();
        self.badness_history.push_front(BadnessEvent {
            timestamp: badness.updated_ts,
            delta: Usage::default(),
            badness,
        });
    }

    /// Prepends a badness update.
    pub fn push_badness(&mut self, badness: Badness, delta: Usage, max_kept: usize) {
        self.badness_history.push_front(BadnessEvent {
            timestamp: badness.updated_ts,
            delta,
            badness,
        });
        self.badness_history.truncate(max_kept);
    }

    /// Prepends a refresh event, bounding the ring buffer.
    pub fn push_event(&mut self, event: RefreshEvent, max_kept: usize) {
        self.history.push_front(event);
        self.history.truncate(max_kept);
    }

    /// Averages cgroup usage over the most recent `window` events.
    pub fn avg_usage(&self, window: usize) -> Usage {
        let usages: Vec<Usage> = self
            .history
            .iter()
            .take(window)
            .map(|e| e.usage)
            .collect();
        Usage::average(&usages)
    }

    /// Averages summed process usage over the most recent `window` events,
    /// optionally counting whitelisted processes only.
    pub fn avg_proc_usage(
        &self,
        window: usize,
        whitelists: &Whitelists,
        whitelisted_only: bool,
    ) -> Usage {
        let mut totals = Vec::new();
        for event in self.history.iter().take(window) {
            let mut total = Usage::default();
            for proc in event.pids.values() {
                let counted = !whitelisted_only
                    || whitelists.is_whitelisted(proc, &self.status.current);
                if counted {
                    total = total.add(proc.usage);
                }
            }
            totals.push(total);
        }
        Usage::average(&totals)
    }

    /// Whether the user can be dropped from tracking.
    pub fn droppable(&self, cfg: &CoreConfig, cgroup_active: bool) -> bool {
        !cgroup_active && self.badness().is_good() && !self.status.in_penalty(cfg)
    }
}

/// Process whitelists per status group, merged from the global list, the
/// group list and their whitelist files.
#[derive(Debug, Clone, Default)]
pub struct Whitelists {
    by_group: BTreeMap<String, HashSet<String>>,
    owner_uids: HashSet<u32>,
}

impl Whitelists {
    /// Builds the whitelist table for every configured status and penalty
    /// group. Whitelist files contain one process name per line; missing
    /// files are skipped.
    pub fn build<F: FileSystem>(cfg: &CoreConfig, fs: &F) -> Self {
        let mut by_group = BTreeMap::new();
        let group_names = cfg
            .status
            .order
            .iter()
            .chain(cfg.status.penalty.order.iter());

        for name in group_names {
            let mut list: HashSet<String> = cfg.processes.whitelist.iter().cloned().collect();
            if cfg.processes.whitelist_other_processes {
                list.insert(OTHER_PROCESSES_LABEL.to_string());
            }
            let mut files = vec![cfg.processes.whitelist_file.clone()];
            if let Some(group) = cfg.status_group(name) {
                list.extend(group.whitelist.iter().cloned());
                files.push(group.whitelist_file.clone());
            }
            for file in files.iter().filter(|f| !f.is_empty()) {
                if let Ok(content) = fs.read_to_string(Path::new(file)) {
                    list.extend(content.lines().map(|l| l.trim().to_string()));
                }
            }
            by_group.insert(name.clone(), list);
        }

        Self {
            by_group,
            owner_uids: cfg.processes.proc_owner_whitelist.iter().copied().collect(),
        }
    }

    /// Whether the process is whitelisted for the status group, either by
    /// name or by owner. Trailing asterisk marks are ignored.
    pub fn is_whitelisted(&self, proc: &StaticProcess, group: &str) -> bool {
        if self.owner_uids.contains(&proc.owner_uid) {
            return true;
        }
        let name = proc.name.trim_end_matches('*');
        self.by_group
            .get(group)
            .is_some_and(|list| list.contains(name))
    }

    /// Appends an asterisk to the names of whitelisted processes so they
    /// are distinguishable in reports.
    pub fn mark(&self, pids: &mut HashMap<i32, StaticProcess>, group: &str) {
        for proc in pids.values_mut() {
            if !proc.name.ends_with('*') && self.is_whitelisted(proc, group) {
                proc.name.push('*');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;
    use crate::config::test_config;

    fn test_user(cfg: &CoreConfig) -> User {
        let status = Status::empty_for(cfg, 1000, &[], "node1");
        User::new(1000, "frodo".into(), vec![1000], status, 0)
    }

    fn proc(name: &str, owner: u32, cpu: f64) -> StaticProcess {
        StaticProcess {
            pid: 7,
            name: name.into(),
            owner_uid: owner,
            uptime_s: 1.0,
            count: 1,
            usage: Usage::new(cpu, 0.0),
        }
    }

    #[test]
    fn new_user_is_new_until_second_badness() {
        let cfg = test_config();
        let mut user = test_user(&cfg);
        assert!(user.is_new());
        user.push_badness(Badness::zero(10), Usage::default(), 60);
        assert!(!user.is_new());
    }

    #[test]
    fn history_is_bounded() {
        let cfg = test_config();
        let mut user = test_user(&cfg);
        for i in 0..10 {
            user.push_event(
                RefreshEvent {
                    time: i,
                    usage: Usage::new(i as f64, 0.0),
                    pids: HashMap::new(),
                },
                4,
            );
        }
        assert_eq!(user.history.len(), 4);
        assert_eq!(user.history.front().map(|e| e.time), Some(9));
    }

    #[test]
    fn avg_usage_over_window() {
        let cfg = test_config();
        let mut user = test_user(&cfg);
        for cpu in [10.0, 20.0, 30.0] {
            user.push_event(
                RefreshEvent {
                    time: 0,
                    usage: Usage::new(cpu, 0.0),
                    pids: HashMap::new(),
                },
                60,
            );
        }
        assert!((user.avg_usage(2).cpu - 25.0).abs() < 1e-9);
        assert!((user.avg_usage(10).cpu - 20.0).abs() < 1e-9);
    }

    #[test]
    fn droppable_requires_all_three() {
        let cfg = test_config();
        let mut user = test_user(&cfg);
        assert!(user.droppable(&cfg, false));
        assert!(!user.droppable(&cfg, true));

        user.set_badness(Badness::imported(10.0, 0.0, 0));
        assert!(!user.droppable(&cfg, false));

        user.set_badness(Badness::zero(0));
        user.status.upgrade_penalty(&cfg, "node1", 0);
        assert!(!user.droppable(&cfg, false));
    }

    #[test]
    fn whitelist_by_name_owner_and_file() {
        let cfg = test_config();
        let fs = MockFs::new();
        let whitelists = Whitelists::build(&cfg, &fs);

        // "gcc" is in the global whitelist of the test config.
        assert!(whitelists.is_whitelisted(&proc("gcc", 1000, 0.0), "normal"));
        assert!(whitelists.is_whitelisted(&proc("gcc*", 1000, 0.0), "normal"));
        assert!(!whitelists.is_whitelisted(&proc("stress", 1000, 0.0), "normal"));

        let mut cfg_owner = cfg.clone();
        cfg_owner.processes.proc_owner_whitelist = vec![0];
        let whitelists = Whitelists::build(&cfg_owner, &fs);
        assert!(whitelists.is_whitelisted(&proc("stress", 0, 0.0), "normal"));

        let mut cfg_file = cfg.clone();
        cfg_file.processes.whitelist_file = "/etc/arbiter/whitelist".into();
        fs.add_file("/etc/arbiter/whitelist", "matlab\n rstudio \n");
        let whitelists = Whitelists::build(&cfg_file, &fs);
        assert!(whitelists.is_whitelisted(&proc("matlab", 1000, 0.0), "normal"));
        assert!(whitelists.is_whitelisted(&proc("rstudio", 1000, 0.0), "normal"));
    }

    #[test]
    fn mark_appends_single_asterisk() {
        let cfg = test_config();
        let fs = MockFs::new();
        let whitelists = Whitelists::build(&cfg, &fs);
        let mut pids = HashMap::new();
        pids.insert(1, proc("gcc", 1000, 50.0));
        whitelists.mark(&mut pids, "normal");
        whitelists.mark(&mut pids, "normal");
        assert_eq!(pids[&1].name, "gcc*");
    }

    #[test]
    fn avg_proc_usage_filters_whitelisted() {
        let cfg = test_config();
        let fs = MockFs::new();
        let whitelists = Whitelists::build(&cfg, &fs);
        let mut user = test_user(&cfg);
        let mut pids = HashMap::new();
        pids.insert(1, proc("gcc", 1000, 50.0));
        pids.insert(2, proc("stress", 1000, 30.0));
        user.push_event(
            RefreshEvent {
                time: 0,
                usage: Usage::new(80.0, 0.0),
                pids,
            },
            60,
        );
        let all = user.avg_proc_usage(1, &whitelists, false);
        assert!((all.cpu - 80.0).abs() < 1e-9);
        let whitelisted = user.avg_proc_usage(1, &whitelists, true);
        assert!((whitelisted.cpu - 50.0).abs() < 1e-9);
    }
}
