//! The per-tick usage collector.
//!
//! One refresh tick takes `poll >= 2` sub-samples of the aggregate
//! `user.slice`, every user slice and every listed pid, then differences
//! consecutive snapshots into `poll - 1` rate records and averages them
//! into one record per entity. A user's history slot for a tick is either
//! fully populated or skipped; partial data never reaches the badness or
//! status logic.

use crate::collector::cgroup::{CgroupAdapter, SampleError};
use crate::collector::procfs::ProcSampler;
use crate::collector::sampler::{
    self, Averaged, Instantaneous, ProcSnapshot, StaticProcess, Target, Usage,
};
use crate::collector::traits::FileSystem;
use crate::config::CoreConfig;
use crate::hostfacts::HostFacts;
use crate::identity::IdentitySource;
use crate::status::Status;
use crate::timers::TimeRecorder;
use crate::user::{RefreshEvent, User, Whitelists};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Collects cgroup and process usage into `User` history.
pub struct Collector<F: FileSystem + Clone> {
    cfg: Arc<CoreConfig>,
    facts: Arc<HostFacts>,
    cgroup: CgroupAdapter<F>,
    procs: ProcSampler<F>,
    identity: Arc<dyn IdentitySource>,
    whitelists: Whitelists,
    users: BTreeMap<u32, User>,
    /// Uids warned about once and ignored thereafter.
    no_passwd_uids: HashSet<u32>,
    /// Pids that already triggered a permission warning.
    denied_pids: HashSet<i32>,
    /// When false, the poll loop never sleeps; tests only.
    pacing: bool,
}

impl<F: FileSystem + Clone> Collector<F> {
    pub fn new(
        cfg: Arc<CoreConfig>,
        facts: Arc<HostFacts>,
        fs: F,
        cgroup_base: &str,
        proc_path: &str,
        identity: Arc<dyn IdentitySource>,
    ) -> Self {
        let whitelists = Whitelists::build(&cfg, &fs);
        Self {
            cfg,
            facts,
            cgroup: CgroupAdapter::new(fs.clone(), cgroup_base),
            procs: ProcSampler::new(fs, proc_path),
            identity,
            whitelists,
            users: BTreeMap::new(),
            no_passwd_uids: HashSet::new(),
            denied_pids: HashSet::new(),
            pacing: true,
        }
    }

    /// Disables the sub-sample sleeps; tests only.
    pub fn without_pacing(mut self) -> Self {
        self.pacing = false;
        self
    }

    pub fn users(&self) -> &BTreeMap<u32, User> {
        &self.users
    }

    pub fn users_mut(&mut self) -> &mut BTreeMap<u32, User> {
        &mut self.users
    }

    pub fn whitelists(&self) -> &Whitelists {
        &self.whitelists
    }

    pub fn cgroup(&self) -> &CgroupAdapter<F> {
        &self.cgroup
    }

    /// Whether the user's cgroup currently exists.
    pub fn user_active(&self, uid: u32) -> bool {
        self.cgroup.active(&Target::User(uid))
    }

    /// Stops tracking a user.
    pub fn remove_user(&mut self, uid: u32) {
        self.users.remove(&uid);
    }

    /// Registers users for uids with an active cgroup that we have not
    /// seen yet. Uids without a passwd entry are warned about once and
    /// skipped permanently.
    pub fn discover_users(&mut self, now: i64) {
        for uid in self.cgroup.list_active_uids(self.cfg.general.min_uid) {
            if self.users.contains_key(&uid) || self.no_passwd_uids.contains(&uid) {
                continue;
            }
            match self.identity.lookup_user(uid) {
                Some(ident) => {
                    let status =
                        Status::empty_for(&self.cfg, uid, &ident.gids, &self.facts.hostname);
                    let user = User::new(uid, ident.username, ident.gids, status, now);
                    debug!(uid = uid, "now tracking {}", user.uid_name);
                    self.users.insert(uid, user);
                }
                None => {
                    warn!(uid = uid, "found a user without a passwd entry, ignoring");
                    self.no_passwd_uids.insert(uid);
                }
            }
        }
    }

    /// Runs one refresh tick of sub-sampling and returns the averaged
    /// aggregate usage across all users.
    pub fn collect(&mut self, now: i64) -> Averaged {
        let poll = self.cfg.general.poll.max(2);
        let sub_interval = Duration::from_secs_f64(
            self.cfg.general.arbiter_refresh as f64 / poll as f64,
        );
        let memsw = self.cfg.processes.memsw;
        let pss = self.cfg.processes.pss;

        let mut aggregate_snaps: Vec<Instantaneous> = Vec::new();
        let mut user_snaps: HashMap<u32, Vec<Instantaneous>> = HashMap::new();
        let mut proc_snaps: HashMap<u32, HashMap<i32, Vec<ProcSnapshot>>> = HashMap::new();
        let mut timer = TimeRecorder::new();

        for _ in 0..poll {
            timer.start(sub_interval);

            match self.cgroup.sample(&Target::Aggregate, memsw) {
                Ok(snap) => aggregate_snaps.push(snap),
                Err(err) => debug!(error = %err, "aggregate sample failed"),
            }

            let uids: Vec<u32> = self.users.keys().copied().collect();
            for uid in uids {
                let snap = match self.cgroup.sample(&Target::User(uid), memsw) {
                    Ok(snap) => snap,
                    Err(SampleError::Disappeared) => continue,
                    Err(err) => {
                        debug!(uid = uid, error = %err, "user sample failed");
                        continue;
                    }
                };
                for &pid in &snap.pids {
                    match self.procs.sample(pid, pss, memsw) {
                        Ok(psnap) => proc_snaps
                            .entry(uid)
                            .or_default()
                            .entry(pid)
                            .or_default()
                            .push(psnap),
                        Err(SampleError::Disappeared) => {}
                        Err(SampleError::Denied(path)) => {
                            if self.denied_pids.insert(pid) {
                                warn!(pid = pid, "cannot read {path}");
                            }
                        }
                        Err(err) => debug!(pid = pid, error = %err, "process sample failed"),
                    }
                }
                user_snaps.entry(uid).or_default().push(snap);
            }

            let remaining = timer.remaining();
            if self.pacing && !remaining.is_zero() {
                std::thread::sleep(remaining);
            }
        }

        for (uid, user) in self.users.iter_mut() {
            let snaps = user_snaps.remove(uid).unwrap_or_default();
            let Some(averaged) = sampler::combine_averaged(&snaps, &self.facts) else {
                // Fewer than two samples; skip this tick for the user.
                continue;
            };

            let mut pids: HashMap<i32, StaticProcess> = HashMap::new();
            for (pid, snaps) in proc_snaps.remove(uid).unwrap_or_default() {
                if let Some(proc) = sampler::combine_processes(&snaps, &self.facts) {
                    pids.insert(pid, proc);
                }
            }

            self.whitelists.mark(&mut pids, &user.status.current);

            // Attribute whatever the cgroup saw beyond the sampled pids to
            // the synthetic residual entry.
            let summed = pids
                .values()
                .fold(Usage::default(), |acc, p| acc.add(p.usage));
            let residual = averaged.usage.sub(summed).clamp_floor();
            pids.insert(
                sampler::OTHER_PROCESSES_PID,
                StaticProcess::other_processes(*uid, residual),
            );

            user.push_event(
                RefreshEvent {
                    time: now,
                    usage: averaged.usage,
                    pids,
                },
                self.cfg.badness.max_history_kept,
            );
        }

        sampler::combine_averaged(&aggregate_snaps, &self.facts).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;
    use crate::config;
    use crate::identity::FixedIdentity;

    fn zero_interval_cfg() -> CoreConfig {
        // refresh 0 keeps the poll loop from sleeping in tests; validation
        // is deliberately bypassed.
        let mut cfg = config::test_config();
        cfg.general.arbiter_refresh = 0;
        cfg
    }

    fn build(fs: &MockFs, cfg: CoreConfig) -> Collector<MockFs> {
        let facts = HostFacts::detect(fs, "/proc").unwrap();
        let identity = FixedIdentity::new()
            .with_user(1000, "frodo", &[1000])
            .with_user(1001, "sam", &[1001]);
        Collector::new(
            Arc::new(cfg),
            Arc::new(facts),
            fs.clone(),
            CgroupAdapter::<MockFs>::DEFAULT_BASE,
            "/proc",
            Arc::new(identity),
        )
    }

    #[test]
    fn discovers_users_with_passwd_entries_only() {
        let fs = MockFs::small_host();
        fs.add_aggregate_slice(0, 0);
        fs.add_user_slice(1000, 0, 0, &[]);
        fs.add_user_slice(2000, 0, 0, &[]); // no passwd entry
        fs.add_user_slice(500, 0, 0, &[]); // below min_uid
        let mut collector = build(&fs, zero_interval_cfg());

        collector.discover_users(0);
        assert!(collector.users().contains_key(&1000));
        assert!(!collector.users().contains_key(&2000));
        assert!(!collector.users().contains_key(&500));

        // Second discovery does not re-create or re-warn.
        collector.discover_users(10);
        assert_eq!(collector.users().len(), 1);
    }

    #[test]
    fn collect_builds_history_with_residual() {
        let fs = MockFs::small_host();
        fs.add_aggregate_slice(0, 0);
        fs.add_user_slice(1000, 0, 4096, &[42]);
        fs.add_process(42, "stress", 1000, 0, 1024);
        let mut collector = build(&fs, zero_interval_cfg());
        collector.discover_users(0);

        let aggregate = collector.collect(100);
        let user = &collector.users()[&1000];
        assert_eq!(user.history.len(), 1);
        let event = &user.history[0];
        assert_eq!(event.time, 100);
        // The sampled pid and the residual entry are both present.
        assert!(event.pids.contains_key(&42));
        assert!(event.pids.contains_key(&sampler::OTHER_PROCESSES_PID));
        let residual = &event.pids[&sampler::OTHER_PROCESSES_PID];
        assert!(residual.usage.cpu >= 0.0);
        assert!(residual.usage.mem >= 0.0);
        assert!(aggregate.usage.cpu >= 0.0);
    }

    #[test]
    fn disappeared_user_skips_tick_without_partial_history() {
        let fs = MockFs::small_host();
        fs.add_aggregate_slice(0, 0);
        fs.add_user_slice(1000, 0, 0, &[]);
        let mut collector = build(&fs, zero_interval_cfg());
        collector.discover_users(0);

        // Vanish before sampling: no event at all for this tick.
        fs.remove("/sys/fs/cgroup/systemd/user.slice/user-1000.slice");
        fs.remove("/sys/fs/cgroup/cpu/user.slice/user-1000.slice");
        fs.remove("/sys/fs/cgroup/cpuacct/user.slice/user-1000.slice");
        fs.remove("/sys/fs/cgroup/memory/user.slice/user-1000.slice");
        collector.collect(100);
        assert!(collector.users()[&1000].history.is_empty());
    }

    #[test]
    fn whitelisted_process_is_marked() {
        let fs = MockFs::small_host();
        fs.add_aggregate_slice(0, 0);
        fs.add_user_slice(1000, 0, 0, &[42]);
        fs.add_process(42, "gcc", 1000, 0, 0);
        let mut collector = build(&fs, zero_interval_cfg());
        collector.discover_users(0);

        collector.collect(100);
        let event = &collector.users()[&1000].history[0];
        assert_eq!(event.pids[&42].name, "gcc*");
    }
}
