//! Node-wide watchers: aggregate high usage and the exit file.

use crate::collector::sampler::Usage;
use crate::collector::traits::FileSystem;
use crate::config::CoreConfig;
use crate::hostfacts::HostFacts;
use crate::identity::IdentitySource;
use crate::timers::TimeRecorder;
use crate::user::User;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::error;

/// Watches aggregate usage across all users and decides when
/// administrators should hear about it. Alerts only after the thresholds
/// have been exceeded for `threshold_period` consecutive ticks, and then
/// no more often than the configured timeout.
pub struct HighUsageWatcher {
    enabled: bool,
    cpu_threshold_pct: f64,
    mem_threshold_pct: f64,
    threshold_period: usize,
    user_count: usize,
    timeout: Duration,
    history: VecDeque<Usage>,
    timer: TimeRecorder,
}

impl HighUsageWatcher {
    pub fn new(cfg: &CoreConfig, facts: &HostFacts) -> Self {
        let watcher = &cfg.high_usage_watcher;
        let mut cpu_count = facts.cpu_count as f64;
        if watcher.div_cpu_thresholds_by_threads_per_core {
            cpu_count /= facts.threads_per_core as f64;
        }
        Self {
            enabled: watcher.high_usage_watcher,
            cpu_threshold_pct: watcher.cpu_usage_threshold * cpu_count * 100.0,
            mem_threshold_pct: watcher.mem_usage_threshold * 100.0,
            threshold_period: watcher.threshold_period.max(1),
            user_count: watcher.user_count,
            timeout: Duration::from_secs(watcher.timeout),
            history: VecDeque::new(),
            timer: TimeRecorder::new(),
        }
    }

    /// Records one tick's aggregate usage.
    pub fn record(&mut self, aggregate: Usage) {
        self.history.push_front(aggregate);
        self.history.truncate(self.threshold_period);
    }

    /// Whether an alert should fire now. Firing arms the rate limit.
    pub fn should_alert(&mut self) -> bool {
        if !self.enabled || !self.timer.expired() {
            return false;
        }
        if self.history.len() < self.threshold_period {
            return false;
        }
        let sustained = self
            .history
            .iter()
            .all(|usage| usage.cpu > self.cpu_threshold_pct || usage.mem > self.mem_threshold_pct);
        if sustained {
            self.timer.start(self.timeout);
        }
        sustained
    }

    /// The top users by combined usage, for the alert body.
    pub fn top_users<'a>(&self, users: &'a BTreeMap<u32, User>) -> Vec<&'a User> {
        let mut sorted: Vec<&User> = users.values().collect();
        sorted.sort_by(|a, b| {
            let a_total = a.cpu_usage + a.mem_usage;
            let b_total = b.cpu_usage + b.mem_usage;
            b_total.partial_cmp(&a_total).unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted.truncate(self.user_count);
        sorted
    }
}

/// Watches a file whose modification time, when advanced by the right
/// group, asks the daemon to exit at the next tick boundary with status
/// 143 (128 + SIGTERM).
pub struct ExitFileWatcher<F: FileSystem> {
    fs: F,
    path: PathBuf,
    group_owner: String,
    identity: std::sync::Arc<dyn IdentitySource>,
    last_update: Option<SystemTime>,
}

impl<F: FileSystem> ExitFileWatcher<F> {
    pub fn new(
        fs: F,
        path: impl Into<PathBuf>,
        group_owner: impl Into<String>,
        identity: std::sync::Arc<dyn IdentitySource>,
    ) -> Self {
        let path = path.into();
        let last_update = fs.modified(&path).ok();
        Self {
            fs,
            path,
            group_owner: group_owner.into(),
            identity,
            last_update,
        }
    }

    /// Whether the exit file was touched since we started and is owned by
    /// the configured group. A missing file never triggers.
    pub fn triggered(&mut self) -> bool {
        let Ok(gid) = self.fs.group_owner(&self.path) else {
            return false;
        };
        let owned = self
            .identity
            .lookup_group_name(gid)
            .is_some_and(|name| name == self.group_owner);
        if !owned {
            return false;
        }
        let Ok(modified) = self.fs.modified(&self.path) else {
            return false;
        };
        let updated = match self.last_update {
            Some(last) => modified > last,
            None => true,
        };
        if updated {
            error!(
                path = %self.path.display(),
                "exit file was updated; exiting at the tick boundary"
            );
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;
    use crate::config::test_config;
    use crate::identity::FixedIdentity;
    use std::sync::Arc;
    use std::time::Duration;

    fn facts() -> HostFacts {
        HostFacts {
            hostname: "node1".into(),
            total_mem_bytes: 8 * 1024 * 1024 * 1024,
            total_swap_bytes: 0,
            cpu_count: 4,
            threads_per_core: 2,
        }
    }

    #[test]
    fn alerts_after_sustained_usage_only() {
        // test config: cpu threshold 0.9 * 4 cpus = 360%, period 2.
        let cfg = test_config();
        let mut watcher = HighUsageWatcher::new(&cfg, &facts());

        watcher.record(Usage::new(380.0, 10.0));
        assert!(!watcher.should_alert());

        watcher.record(Usage::new(380.0, 10.0));
        assert!(watcher.should_alert());
    }

    #[test]
    fn alert_is_rate_limited() {
        let cfg = test_config();
        let mut watcher = HighUsageWatcher::new(&cfg, &facts());
        watcher.record(Usage::new(380.0, 10.0));
        watcher.record(Usage::new(380.0, 10.0));
        assert!(watcher.should_alert());
        watcher.record(Usage::new(380.0, 10.0));
        assert!(!watcher.should_alert());
    }

    #[test]
    fn either_resource_can_trip() {
        let cfg = test_config();
        let mut watcher = HighUsageWatcher::new(&cfg, &facts());
        watcher.record(Usage::new(0.0, 95.0));
        watcher.record(Usage::new(0.0, 95.0));
        assert!(watcher.should_alert());
    }

    #[test]
    fn a_quiet_tick_resets_the_streak() {
        let cfg = test_config();
        let mut watcher = HighUsageWatcher::new(&cfg, &facts());
        watcher.record(Usage::new(380.0, 10.0));
        watcher.record(Usage::new(10.0, 10.0));
        assert!(!watcher.should_alert());
    }

    #[test]
    fn divides_cpu_threshold_by_threads_per_core() {
        let mut cfg = test_config();
        cfg.high_usage_watcher.div_cpu_thresholds_by_threads_per_core = true;
        let mut watcher = HighUsageWatcher::new(&cfg, &facts());
        // Threshold now 0.9 * (4/2) * 100 = 180%.
        watcher.record(Usage::new(200.0, 10.0));
        watcher.record(Usage::new(200.0, 10.0));
        assert!(watcher.should_alert());
    }

    fn exit_watcher(fs: &MockFs) -> ExitFileWatcher<MockFs> {
        let identity = FixedIdentity::new().with_group(50, "arbiter");
        ExitFileWatcher::new(fs.clone(), "/run/arbiter/exit", "arbiter", Arc::new(identity))
    }

    #[test]
    fn triggers_on_mtime_advance_by_owning_group() {
        let fs = MockFs::new();
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        fs.add_file("/run/arbiter/exit", "");
        fs.set_modified("/run/arbiter/exit", start);
        fs.set_group_owner("/run/arbiter/exit", 50);

        let mut watcher = exit_watcher(&fs);
        assert!(!watcher.triggered());

        fs.set_modified("/run/arbiter/exit", start + Duration::from_secs(5));
        assert!(watcher.triggered());
    }

    #[test]
    fn wrong_group_never_triggers() {
        let fs = MockFs::new();
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        fs.add_file("/run/arbiter/exit", "");
        fs.set_modified("/run/arbiter/exit", start);
        fs.set_group_owner("/run/arbiter/exit", 999);

        let mut watcher = exit_watcher(&fs);
        fs.set_modified("/run/arbiter/exit", start + Duration::from_secs(5));
        assert!(!watcher.triggered());
    }

    #[test]
    fn missing_file_never_triggers() {
        let fs = MockFs::new();
        let mut watcher = exit_watcher(&fs);
        assert!(!watcher.triggered());
    }
}
