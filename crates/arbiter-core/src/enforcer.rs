//! Quota enforcement against cgroup files.
//!
//! CPU is a single write. Memory must scale: the kernel refuses a limit
//! below the cgroup's current charge, so the enforcer walks linearly from
//! the aimed limit toward the fallback (the default group's quota) until a
//! write sticks. Before writing anything, current quotas are read back and
//! compared with a ±5% `mostly_eq` margin; "good enough" is intended and
//! avoids ping-ponging with limits the kernel rounded.

use crate::collector::cgroup::{CgroupAdapter, SampleError};
use crate::collector::sampler::Target;
use crate::collector::traits::FileSystem;
use crate::hostfacts::HostFacts;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Relative margin within which quotas count as already applied.
const MOSTLY_EQ_FUDGE: f64 = 0.05;
/// Scale-down attempts from aimed toward fallback.
const MEM_RETRIES: u32 = 5;
/// Pause between scale-down attempts.
const MEM_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How a memory quota write ended up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteOutcome {
    /// The aimed limit was accepted.
    Exact,
    /// An intermediate value on the way to the fallback was accepted;
    /// carries the percent actually written.
    Scaled(f64),
    /// Only the fallback quota could be applied; the penalty was not
    /// realized this tick.
    FallbackOnly,
    /// Neither the aimed nor the fallback limit wrote.
    Failed,
    /// Current quotas were already within the margin; nothing written.
    Skipped,
}

/// Desired quotas for one user: cpu as percent of a core, mem as percent
/// of the machine.
#[derive(Debug, Clone, Copy)]
pub struct QuotaPair {
    pub cpu: f64,
    pub mem: f64,
}

/// Result of one enforcement pass.
#[derive(Debug, Clone, Copy)]
pub struct EnforceReport {
    pub cpu_written: bool,
    pub mem: WriteOutcome,
}

/// Returns whether two values are equal within the fudge margin.
pub fn mostly_eq(lvalue: f64, rvalue: f64) -> bool {
    lvalue >= rvalue * (1.0 - MOSTLY_EQ_FUDGE) && lvalue <= rvalue * (1.0 + MOSTLY_EQ_FUDGE)
}

/// Applies cgroup quotas for users.
pub struct Enforcer<F: FileSystem> {
    cgroup: CgroupAdapter<F>,
    facts: Arc<HostFacts>,
    memsw: bool,
    retry_delay: Duration,
}

impl<F: FileSystem> Enforcer<F> {
    pub fn new(cgroup: CgroupAdapter<F>, facts: Arc<HostFacts>, memsw: bool) -> Self {
        Self {
            cgroup,
            facts,
            memsw,
            retry_delay: MEM_RETRY_DELAY,
        }
    }

    /// Disables the scale-down pause; tests only.
    pub fn without_retry_delay(mut self) -> Self {
        self.retry_delay = Duration::ZERO;
        self
    }

    /// Applies `aimed` quotas to the user, falling back toward `fallback`
    /// for memory. Both writes are independent; a cpu failure never blocks
    /// the memory write.
    pub fn apply(&self, uid: u32, aimed: QuotaPair, fallback: QuotaPair) -> EnforceReport {
        let target = Target::User(uid);

        // Read back current quotas; skip writes that are already close
        // enough. The kernel may not accept lowering memory below current
        // RSS exactly, and third-party writers are tolerated the same way.
        let current_cpu = self.cgroup.cpu_quota(&target).ok();
        let current_mem = self
            .cgroup
            .mem_quota_bytes(&target, self.memsw)
            .ok()
            .map(|bytes| self.facts.bytes_to_pct(bytes));

        let cpu_needed = !current_cpu.is_some_and(|cur| mostly_eq(cur, aimed.cpu));
        let mem_needed = !current_mem.is_some_and(|cur| mostly_eq(cur, aimed.mem));
        if !cpu_needed && !mem_needed {
            return EnforceReport {
                cpu_written: false,
                mem: WriteOutcome::Skipped,
            };
        }

        let cpu_written = if cpu_needed {
            self.write_cpu(&target, uid, aimed.cpu)
        } else {
            false
        };
        let mem = if mem_needed {
            self.scale_mem(&target, uid, aimed.mem, fallback.mem)
        } else {
            WriteOutcome::Skipped
        };

        EnforceReport { cpu_written, mem }
    }

    fn write_cpu(&self, target: &Target, uid: u32, pct: f64) -> bool {
        match self.cgroup.set_cpu_quota(target, pct) {
            Ok(()) => {
                debug!(uid = uid, "set cpu quota to {:.1}%", pct);
                true
            }
            Err(SampleError::Disappeared) => {
                info!(uid = uid, "user disappeared before the cpu limit could be set");
                false
            }
            Err(err) => {
                info!(uid = uid, error = %err, "failed to set cpu quota of {:.1}%", pct);
                false
            }
        }
    }

    /// Attempts the aimed memory limit, stepping linearly toward the
    /// fallback between tries.
    fn scale_mem(&self, target: &Target, uid: u32, aimed: f64, fallback: f64) -> WriteOutcome {
        let step = (fallback - aimed) / MEM_RETRIES as f64;
        let mut limit = aimed;
        let mut last_err = None;

        for attempt in 0..MEM_RETRIES {
            match self
                .cgroup
                .set_mem_quota(target, limit, self.memsw, &self.facts)
            {
                Ok(()) => {
                    return if attempt == 0 {
                        debug!(uid = uid, "set memory quota to {:.1}%", limit);
                        WriteOutcome::Exact
                    } else if mostly_eq(limit, fallback) {
                        debug!(
                            uid = uid,
                            "only the fallback memory quota ({:.1}%) could be applied", limit
                        );
                        WriteOutcome::FallbackOnly
                    } else {
                        debug!(
                            uid = uid,
                            "scaled memory quota to {:.1}% from a goal of {:.1}%", limit, aimed
                        );
                        WriteOutcome::Scaled(limit)
                    };
                }
                Err(SampleError::Disappeared) => {
                    info!(uid = uid, "user disappeared before the memory limit could be set");
                    return WriteOutcome::Failed;
                }
                Err(err) => {
                    last_err = Some(err);
                    limit += step;
                    if !self.retry_delay.is_zero() {
                        std::thread::sleep(self.retry_delay);
                    }
                }
            }
        }

        if let Some(err) = last_err {
            warn!(
                uid = uid,
                error = %err,
                "failed to write both the aimed ({:.1}%) and fallback ({:.1}%) memory limits",
                aimed,
                fallback
            );
        }
        WriteOutcome::Failed
    }
}
