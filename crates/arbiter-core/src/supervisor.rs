//! The per-tick evaluation loop.
//!
//! One refresh tick runs, in order: collect usage into history, update
//! each user's badness, evaluate the status decision table, apply quotas,
//! write our rows to the store, reconcile with peers, and emit
//! notifications. Store writes for tick N are visible to peers before our
//! tick N+1 reads them (the store must offer read-your-writes); no
//! ordering holds between concurrent hosts' ticks.

use crate::badness::Badness;
use crate::collector::sampler::{self, StaticProcess, Usage};
use crate::collector::traits::FileSystem;
use crate::collector::Collector;
use crate::config::CoreConfig;
use crate::enforcer::{Enforcer, QuotaPair};
use crate::hostfacts::HostFacts;
use crate::notifier::{HighUsageNotice, Mailer, NiceNotice, Notifier, WarnNotice};
use crate::status::{self, Status};
use crate::store::sync::Synchronizer;
use crate::store::{StatusStore, StoreHandle};
use crate::timers::TimeRecorder;
use crate::user::User;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Seconds between store cleanup passes.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// What the decision table chose for a user this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Violation outside penalty: raise the penalty tier.
    UpgradePenalty,
    /// Nonzero badness outside penalty; restart the forgiveness window
    /// when occurrences are being remembered.
    TrackBadness { reset_occur_timeout: bool },
    /// Good behavior long enough: forgive one occurrence.
    LowerOccurrences,
    /// Penalty timeout elapsed: release to the default group.
    DowngradePenalty,
    /// Still serving a penalty.
    ServePenalty,
    /// Nothing to do.
    Idle,
}

/// The status decision table, evaluated top to bottom after the badness
/// update; first match wins. Pure function of the user's state.
pub fn evaluate(user: &User, cfg: &CoreConfig, now: i64) -> Decision {
    let badness = user.badness();
    if !user.status.in_penalty(cfg) {
        if badness.is_violation() {
            return Decision::UpgradePenalty;
        }
        if badness.is_bad() {
            return Decision::TrackBadness {
                reset_occur_timeout: user.status.has_occurrences(),
            };
        }
        if user.status.has_occurrences() && user.status.occurrences_expired(cfg, now) {
            return Decision::LowerOccurrences;
        }
        return Decision::Idle;
    }
    if user.status.penalty_expired(cfg, now) {
        return Decision::DowngradePenalty;
    }
    Decision::ServePenalty
}

/// Counters for one tick, for logs and tests.
#[derive(Debug, Default, Clone)]
pub struct TickSummary {
    pub users_tracked: usize,
    pub upgraded: Vec<u32>,
    pub downgraded: Vec<u32>,
    pub adopted: usize,
    pub high_usage_alert: bool,
}

/// Ties the collector, badness engine, status machine, enforcer, store and
/// notifier together. Owns the in-memory user table exclusively.
pub struct Supervisor<F: FileSystem + Clone, S: StatusStore, M: Mailer> {
    cfg: Arc<CoreConfig>,
    facts: Arc<HostFacts>,
    collector: Collector<F>,
    enforcer: Enforcer<F>,
    store: StoreHandle<S>,
    synchronizer: Synchronizer,
    notifier: Notifier<M>,
    high_usage: crate::watcher::HighUsageWatcher,
    /// Stored badness from before our start, imported into users the
    /// first time they appear.
    imported_badness: BTreeMap<u32, Badness>,
    /// Peer rows from the previous tick's sync read, used to spot
    /// penalties whose authority host stopped maintaining them.
    peer_rows: BTreeMap<u32, BTreeMap<String, Status>>,
    cleanup_timer: TimeRecorder,
}

impl<F: FileSystem + Clone, S: StatusStore, M: Mailer> Supervisor<F, S, M> {
    pub fn new(
        cfg: Arc<CoreConfig>,
        facts: Arc<HostFacts>,
        collector: Collector<F>,
        enforcer: Enforcer<F>,
        store: StoreHandle<S>,
        notifier: Notifier<M>,
    ) -> Self {
        let high_usage = crate::watcher::HighUsageWatcher::new(&cfg, &facts);
        let synchronizer = Synchronizer::new(facts.hostname.clone());
        Self {
            cfg,
            facts,
            collector,
            enforcer,
            store,
            synchronizer,
            notifier,
            high_usage,
            imported_badness: BTreeMap::new(),
            peer_rows: BTreeMap::new(),
            cleanup_timer: TimeRecorder::new(),
        }
    }

    pub fn collector(&self) -> &Collector<F> {
        &self.collector
    }

    pub fn store(&mut self) -> &mut StoreHandle<S> {
        &mut self.store
    }

    /// Startup work: migrate tables and read the stored badness for
    /// later import. Store failures here are fatal to the caller.
    pub fn prime(&mut self) -> Result<(), crate::store::StoreError> {
        let outcome = self.store.ensure_tables()?;
        if outcome.migrated {
            info!("status store migrated to the v3 schema");
        }
        self.imported_badness = self.store.load_badness()?;
        if !self.imported_badness.is_empty() {
            debug!(
                count = self.imported_badness.len(),
                "stored badness available for import"
            );
        }
        Ok(())
    }

    /// Runs one refresh tick.
    pub fn tick(&mut self, now: i64) -> TickSummary {
        let mut summary = TickSummary::default();

        self.collector.discover_users(now);
        let aggregate = self.collector.collect(now);
        self.high_usage.record(aggregate.usage);

        let uids: Vec<u32> = self.collector.users().keys().copied().collect();
        summary.users_tracked = uids.len();
        for uid in uids {
            self.evaluate_user(uid, now, &mut summary);
        }

        self.persist_and_sync(now, &mut summary);

        if self.high_usage.should_alert() {
            summary.high_usage_alert = true;
            let top_users = self
                .high_usage
                .top_users(self.collector.users())
                .iter()
                .map(|u| (u.uid_name.clone(), Usage::new(u.cpu_usage, u.mem_usage)))
                .collect();
            info!("sending an overall high usage alert");
            self.notifier.high_usage(&HighUsageNotice {
                hostname: self.facts.hostname.clone(),
                usage: aggregate.usage,
                top_users,
            });
        }

        if self.cleanup_timer.expired() {
            match self.store.cleanup() {
                Ok(()) => self.cleanup_timer.start(CLEANUP_INTERVAL),
                Err(err) => debug!(error = %err, "store cleanup failed; will try again"),
            }
        }

        summary
    }

    fn evaluate_user(&mut self, uid: u32, now: i64, summary: &mut TickSummary) {
        let cfg = self.cfg.clone();
        let hostname = self.facts.hostname.clone();
        let cgroup_active = self.collector.user_active(uid);
        let window = cfg.general.history_per_refresh;

        // Import stored badness the first time the user shows up.
        if let Some(imported) = self.imported_badness.remove(&uid)
            && let Some(user) = self.collector.users_mut().get_mut(&uid)
            && user.is_new()
        {
            if !imported.expired(cfg.badness.imported_badness_timeout, now) && imported.is_bad() {
                debug!(uid = uid, "importing stored badness for {}", user.uid_name);
                user.set_badness(imported);
            } else if let Err(err) = self.store.remove_badness(uid) {
                debug!(uid = uid, error = %err, "could not drop expired stored badness");
            }
        }

        let whitelists = self.collector.whitelists().clone();
        let Some(user) = self.collector.users_mut().get_mut(&uid) else {
            return;
        };

        // Refresh derived fields from the current status group.
        let avg = user.avg_usage(window);
        user.cpu_usage = avg.cpu;
        user.mem_usage = avg.mem;
        let (cpu_quota, mem_quota) =
            status::quotas_for(&cfg, &self.facts, &user.status.current, &user.status.default);
        user.cpu_quota = cpu_quota;
        user.mem_quota = mem_quota;

        let badness = user.badness();
        let in_penalty = user.status.in_penalty(&cfg);
        if !cgroup_active && badness.is_good() && !in_penalty {
            debug!(
                uid = uid,
                "no longer tracking {} (logged out with good behavior)", user.uid_name
            );
            self.collector.remove_user(uid);
            return;
        }

        // Re-assert quotas for the current group every tick; the enforcer
        // skips writes that are already within the margin.
        if !cfg.general.debug_mode && cgroup_active {
            let (fallback_cpu, fallback_mem) =
                status::quotas_for(&cfg, &self.facts, &user.status.default, &user.status.default);
            let report = self.enforcer.apply(
                uid,
                QuotaPair { cpu: cpu_quota, mem: mem_quota },
                QuotaPair { cpu: fallback_cpu, mem: fallback_mem },
            );
            debug!(uid = uid, report = ?report.mem, "quota pass");
        }

        // Badness update. Penalized users accrue nothing; everyone else
        // is scored on cgroup usage with whitelisted cpu subtracted
        // (memory counts regardless, it cannot be throttled).
        let user = match self.collector.users_mut().get_mut(&uid) {
            Some(user) => user,
            None => return,
        };
        if in_penalty {
            user.push_badness(Badness::zero(now), Usage::default(), cfg.badness.max_history_kept);
        } else {
            let scored = badness_usage(user, &whitelists, window);
            let mut badness = user.badness();
            let delta = badness.update(
                scored,
                Usage::new(cpu_quota, mem_quota),
                &cfg,
                now,
            );
            user.push_badness(badness, delta, cfg.badness.max_history_kept);
        }

        match evaluate(user, &cfg, now) {
            Decision::UpgradePenalty => {
                summary.upgraded.push(uid);
                self.upgrade_penalty(uid, now);
            }
            Decision::TrackBadness { reset_occur_timeout } => {
                info!(
                    uid = uid,
                    score = user.badness().score(),
                    "{} has nonzero badness",
                    user.uid_name
                );
                if reset_occur_timeout {
                    user.status.reset_occurrences_timeout(now);
                    info!(uid = uid, "resetting the occurrences timeout of {}", user.uid_name);
                }
            }
            Decision::LowerOccurrences => {
                user.status.lower_occurrences(&hostname, now);
                info!(
                    uid = uid,
                    occurrences = user.status.occurrences,
                    "lowered the occurrences count of {}",
                    user.uid_name
                );
            }
            Decision::DowngradePenalty => {
                summary.downgraded.push(uid);
                self.downgrade_penalty(uid, now);
            }
            Decision::ServePenalty => {
                let served = now - user.status.timestamp;
                debug!(
                    uid = uid,
                    "{} has spent {}s in penalty of a required {}s",
                    user.uid_name,
                    served,
                    user.status.penalty_timeout(&cfg)
                );
            }
            Decision::Idle => {}
        }
    }

    /// Raises the user's penalty tier, zeroes badness, applies the new
    /// quotas and emails the warning. We claim authority even if a peer
    /// held it.
    fn upgrade_penalty(&mut self, uid: u32, now: i64) {
        let cfg = self.cfg.clone();
        let hostname = self.facts.hostname.clone();
        let Some(user) = self.collector.users_mut().get_mut(&uid) else {
            return;
        };

        if !user.status.authoritative(&hostname) {
            debug!(
                uid = uid,
                "overriding previous authority {} to upgrade penalty on {}",
                user.status.authority,
                hostname
            );
        }
        info!(uid = uid, "increasing the penalty status of {}", user.uid_name);

        let badness_started = user.badness().start_of_bad_ts;
        let (prev_cpu, prev_mem) =
            status::quotas_for(&cfg, &self.facts, &user.status.default, &user.status.default);
        let new_group = user.status.upgrade_penalty(&cfg, &hostname, now);
        // Badness drops to zero with the violation so a store and arbiter
        // failure cannot re-penalize the user right after release.
        user.push_badness(Badness::zero(now), Usage::default(), cfg.badness.max_history_kept);

        let (new_cpu, new_mem) =
            status::quotas_for(&cfg, &self.facts, &new_group, &user.status.default);
        user.cpu_quota = new_cpu;
        user.mem_quota = new_mem;

        let username = user.username.clone();
        let status_snapshot = user.status.clone();
        let top_processes = top_processes(
            user,
            cfg.general.history_per_refresh,
            cfg.email.table_process_cap,
            Usage::new(prev_cpu, prev_mem),
        );

        // Write through immediately so a crash cannot lose the penalty.
        if let Err(err) = self.store.write_statuses(&[(uid, status_snapshot)]) {
            warn!(uid = uid, error = %err, "could not persist the new penalty status");
        }
        if let Err(err) = self.store.write_badness(&[(uid, Badness::zero(now))]) {
            debug!(uid = uid, error = %err, "could not persist the badness reset");
        }

        if cfg.general.debug_mode {
            debug!(uid = uid, "not setting quotas because debug mode is on");
        } else {
            let report = self.enforcer.apply(
                uid,
                QuotaPair { cpu: new_cpu, mem: new_mem },
                QuotaPair { cpu: prev_cpu, mem: prev_mem },
            );
            debug!(uid = uid, report = ?report.mem, "penalty quota pass");
        }

        let severity = cfg
            .status_group(&new_group)
            .map(|g| g.expression.clone())
            .unwrap_or_default();
        self.notifier.warn(&WarnNotice {
            uid,
            username,
            hostname,
            severity,
            status_group: new_group.clone(),
            prev_quotas: Usage::new(prev_cpu, prev_mem),
            new_quotas: Usage::new(new_cpu, new_mem),
            badness_started,
            penalty_minutes: cfg.penalty_timeout(&new_group) / 60,
            hosts: self.store.known_syncing_hosts(),
            top_processes,
        });
    }

    /// Releases an expired penalty back to the default group. Only the
    /// host that was authoritative at entry emails the user; the others
    /// lowered the penalty independently and stay quiet.
    fn downgrade_penalty(&mut self, uid: u32, now: i64) {
        let cfg = self.cfg.clone();
        let hostname = self.facts.hostname.clone();
        let (was_authoritative, old_authority) = match self.collector.users().get(&uid) {
            Some(user) => (
                user.status.authoritative(&hostname),
                user.status.authority.clone(),
            ),
            None => return,
        };
        let authority_failed =
            !was_authoritative && self.authority_abandoned(uid, &old_authority, now);
        let Some(user) = self.collector.users_mut().get_mut(&uid) else {
            return;
        };

        info!(uid = uid, "decreasing the penalty status of {}", user.uid_name);
        let new_group = user.status.downgrade_penalty(&hostname, now);
        user.push_badness(Badness::zero(now), Usage::default(), cfg.badness.max_history_kept);

        let (cpu, mem) = status::quotas_for(&cfg, &self.facts, &new_group, &new_group);
        user.cpu_quota = cpu;
        user.mem_quota = mem;
        let username = user.username.clone();
        let status_snapshot = user.status.clone();

        if let Err(err) = self.store.write_statuses(&[(uid, status_snapshot)]) {
            warn!(uid = uid, error = %err, "could not persist the released status");
        }
        if let Err(err) = self.store.write_badness(&[(uid, Badness::zero(now))]) {
            debug!(uid = uid, error = %err, "could not persist the badness reset");
        }

        if cfg.general.debug_mode {
            debug!(uid = uid, "not setting quotas because debug mode is on");
        } else {
            let report = self.enforcer.apply(
                uid,
                QuotaPair { cpu, mem },
                QuotaPair { cpu, mem },
            );
            debug!(uid = uid, report = ?report.mem, "release quota pass");
        }

        // The authoritative host sends the all-clear. A host that merely
        // adopted the penalty stays quiet, unless the authority's stored
        // row shows it stopped maintaining the penalty (crashed); then
        // nobody else will mail and we do.
        if was_authoritative || authority_failed {
            self.notifier.nice(&NiceNotice {
                uid,
                username,
                hostname,
                status_group: new_group,
            });
        } else {
            debug!(
                uid = uid,
                "not emailing: {} is not authoritative here ({} is)", hostname, old_authority
            );
        }
    }

    /// Batch-writes statuses and badness, then reconciles with the store
    /// and peers. Failures skip the cycle; the next tick re-reads state.
    fn persist_and_sync(&mut self, now: i64, summary: &mut TickSummary) {
        let cfg = self.cfg.clone();

        let statuses: Vec<(u32, Status)> = self
            .collector
            .users()
            .iter()
            .map(|(uid, user)| (*uid, user.status.clone()))
            .collect();
        let badness: Vec<(u32, Badness)> = self
            .collector
            .users()
            .iter()
            .map(|(uid, user)| (*uid, user.badness()))
            .collect();

        if let Err(err) = self.store.write_statuses(&statuses) {
            warn!(error = %err, "skipping status writes this tick");
        }
        if let Err(err) = self.store.write_badness(&badness) {
            warn!(error = %err, "skipping badness writes this tick");
        }

        let mut status_map: BTreeMap<u32, Status> = statuses.into_iter().collect();

        match self.synchronizer.sync_from_self(&mut self.store, &mut status_map) {
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "skipping self sync this tick");
            }
        }
        match self
            .synchronizer
            .sync_from_peers(&mut self.store, &mut status_map, &cfg, now)
        {
            Ok((adoptions, raw)) => {
                summary.adopted = adoptions.len();
                self.peer_rows = raw;
            }
            Err(err) => {
                warn!(error = %err, "skipping peer sync this tick");
            }
        }

        for (uid, mut status) in status_map {
            if let Some(user) = self.collector.users_mut().get_mut(&uid) {
                // The configuration stays the source of truth for default
                // groups, whatever an adopted row claimed.
                status.enforce_cfg_consistency(&cfg, uid, &user.gids);
                user.status = status;
            }
        }
    }

    /// Whether the host that holds mail authority for this user has
    /// visibly stopped maintaining the penalty: its stored row still
    /// shows the penalty although the timeout elapsed more than one
    /// refresh interval ago. A live authority would have released (and
    /// rewritten) its row within a tick of expiry.
    fn authority_abandoned(&self, uid: u32, authority: &str, now: i64) -> bool {
        let cfg = &self.cfg;
        let grace = cfg.general.arbiter_refresh as i64;
        self.peer_rows
            .get(&uid)
            .and_then(|hosts| hosts.get(authority))
            .is_some_and(|row| {
                row.in_penalty(cfg)
                    && row.timestamp + row.penalty_timeout(cfg) as i64 + grace < now
            })
    }
}

/// The usage a user is scored on: averaged cgroup usage with whitelisted
/// process cpu subtracted. Memory counts regardless of whitelists, since
/// it cannot be throttled the way cpu can.
fn badness_usage(user: &User, whitelists: &crate::user::Whitelists, window: usize) -> Usage {
    let avg = user.avg_usage(window);
    let whitelisted = user.avg_proc_usage(window, whitelists, true);
    Usage::new((avg.cpu - whitelisted.cpu).max(0.0), avg.mem)
}

/// Merges the user's recent processes by name and returns the heaviest,
/// ranked by usage relative to the quotas.
fn top_processes(user: &User, window: usize, cap: usize, quotas: Usage) -> Vec<StaticProcess> {
    let events: Vec<StaticProcess> = user
        .history
        .iter()
        .take(window)
        .flat_map(|event| event.pids.values().cloned())
        .collect();
    let mut merged = sampler::merge_by_name(&events);
    merged.sort_by(|a, b| {
        let rel = |p: &StaticProcess| {
            let cpu = if quotas.cpu > 0.0 { p.usage.cpu / quotas.cpu } else { 0.0 };
            let mem = if quotas.mem > 0.0 { p.usage.mem / quotas.mem } else { 0.0 };
            cpu + mem
        };
        rel(b).partial_cmp(&rel(a)).unwrap_or(std::cmp::Ordering::Equal)
    });
    merged.truncate(cap);
    merged
}
