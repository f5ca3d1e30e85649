//! Per-user, per-resource badness scoring.
//!
//! Badness is a rolling score in [0, 100] per resource expressing how long
//! a user's usage has stayed above the configured threshold relative to
//! their quota. The score of a user is the sum over both resources; a
//! score of at least 100 on any resource is a violation and triggers a
//! penalty.

use crate::collector::sampler::Usage;
use crate::config::CoreConfig;

/// A badness score at a particular time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Badness {
    /// Cpu badness in [0, 100].
    pub cpu: f64,
    /// Mem badness in [0, 100].
    pub mem: f64,
    /// Epoch seconds of the last update.
    pub updated_ts: i64,
    /// Epoch seconds when the score first became positive since it was
    /// last zero; 0 while the score is zero.
    pub start_of_bad_ts: i64,
}

impl Badness {
    /// A zero score updated at `now`.
    pub fn zero(now: i64) -> Self {
        Self {
            cpu: 0.0,
            mem: 0.0,
            updated_ts: now,
            start_of_bad_ts: 0,
        }
    }

    /// A score imported from the store.
    pub fn imported(cpu: f64, mem: f64, updated_ts: i64) -> Self {
        let mut badness = Self {
            cpu,
            mem,
            updated_ts,
            start_of_bad_ts: 0,
        };
        if badness.is_bad() {
            badness.start_of_bad_ts = updated_ts;
        }
        badness
    }

    pub fn score(&self) -> f64 {
        self.cpu + self.mem
    }

    pub fn is_good(&self) -> bool {
        self.cpu == 0.0 && self.mem == 0.0
    }

    pub fn is_bad(&self) -> bool {
        !self.is_good()
    }

    /// Whether the score reached the violation ceiling on any resource.
    pub fn is_violation(&self) -> bool {
        self.score() >= 100.0
    }

    /// Whether a stored score is too old to import.
    pub fn expired(&self, timeout: u64, now: i64) -> bool {
        self.updated_ts + (timeout as i64) < now
    }

    /// Drops the score to zero, as happens on penalty transitions.
    pub fn reset(&mut self, now: i64) {
        *self = Self::zero(now);
    }

    /// Applies one refresh tick's delta derived from usage against quotas.
    /// Returns the applied delta. Scores clamp to [0, 100]; the onset
    /// timestamp tracks zero/nonzero transitions.
    pub fn update(
        &mut self,
        usage: Usage,
        quotas: Usage,
        cfg: &CoreConfig,
        now: i64,
    ) -> Usage {
        let was_bad = self.is_bad();
        let delta = delta_badness(usage, quotas, cfg);
        self.cpu = (self.cpu + delta.cpu).clamp(0.0, 100.0);
        self.mem = (self.mem + delta.mem).clamp(0.0, 100.0);
        self.updated_ts = now;

        if was_bad && self.is_good() {
            self.start_of_bad_ts = 0;
        } else if !was_bad && self.is_bad() {
            self.start_of_bad_ts = now;
        }
        delta
    }
}

/// Computes the per-resource badness delta for one refresh tick.
///
/// Above the threshold the score grows proportionally to relative usage,
/// reaching 100 after `time_to_max_bad` seconds at exactly threshold
/// usage; below it the score decays, reaching 0 after `time_to_min_bad`
/// seconds of zero usage.
pub fn delta_badness(usage: Usage, quotas: Usage, cfg: &CoreConfig) -> Usage {
    let refresh = cfg.general.arbiter_refresh as f64;

    let per_resource = |usage: f64, quota: f64, threshold: f64| -> f64 {
        let max_incr_per_interval = 100.0 / (cfg.badness.time_to_max_bad * threshold) * refresh;
        let max_decr_per_interval = 100.0 / cfg.badness.time_to_min_bad * refresh;

        // Keep scores consistent between debug and non-debug mode (where
        // usage cannot exceed the quota), and shield against erroneous
        // samples when capping is configured.
        let usage = if cfg.general.debug_mode || cfg.badness.cap_badness_incr {
            usage.min(quota)
        } else {
            usage
        };

        let rel_usage = usage / quota;
        if rel_usage >= threshold {
            rel_usage * max_incr_per_interval
        } else {
            (1.0 - rel_usage) * -max_decr_per_interval
        }
    };

    Usage::new(
        per_resource(usage.cpu, quotas.cpu, cfg.badness.cpu_badness_threshold),
        per_resource(usage.mem, quotas.mem, cfg.badness.mem_badness_threshold),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    // test_config: refresh 10s, cpu threshold 0.8, mem threshold 0.5,
    // time_to_max_bad 60s, time_to_min_bad 30s, cap off.

    #[test]
    fn grows_above_threshold() {
        let cfg = test_config();
        let delta = delta_badness(Usage::new(100.0, 0.0), Usage::new(100.0, 50.0), &cfg);
        // rel 1.0 >= 0.8: 1.0 * 100 / (60 * 0.8) * 10 = 20.833...
        assert!((delta.cpu - 20.833).abs() < 0.01);
        // mem rel 0: full decay, -100/30*10
        assert!((delta.mem + 33.333).abs() < 0.01);
    }

    #[test]
    fn decays_below_threshold() {
        let cfg = test_config();
        let delta = delta_badness(Usage::new(40.0, 0.0), Usage::new(100.0, 50.0), &cfg);
        // rel 0.4 < 0.8: (1 - 0.4) * -100/30*10 = -20
        assert!((delta.cpu + 20.0).abs() < 0.01);
    }

    #[test]
    fn cap_limits_increase() {
        let mut cfg = test_config();
        cfg.badness.cap_badness_incr = true;
        let capped = delta_badness(Usage::new(400.0, 0.0), Usage::new(100.0, 50.0), &cfg);
        cfg.badness.cap_badness_incr = false;
        let uncapped = delta_badness(Usage::new(400.0, 0.0), Usage::new(100.0, 50.0), &cfg);
        assert!(capped.cpu < uncapped.cpu);
    }

    #[test]
    fn score_clamps_to_bounds() {
        let cfg = test_config();
        let mut badness = Badness::zero(0);
        for tick in 1..=20 {
            badness.update(Usage::new(200.0, 0.0), Usage::new(100.0, 50.0), &cfg, tick * 10);
            assert!(badness.cpu <= 100.0);
            assert!(badness.mem >= 0.0);
        }
        assert_eq!(badness.cpu, 100.0);
        assert!(badness.is_violation());
    }

    #[test]
    fn onset_timestamp_tracks_transitions() {
        let cfg = test_config();
        let mut badness = Badness::zero(0);
        assert_eq!(badness.start_of_bad_ts, 0);

        badness.update(Usage::new(200.0, 0.0), Usage::new(100.0, 50.0), &cfg, 100);
        assert!(badness.is_bad());
        assert_eq!(badness.start_of_bad_ts, 100);

        // Stays at the onset time while bad.
        badness.update(Usage::new(200.0, 0.0), Usage::new(100.0, 50.0), &cfg, 110);
        assert_eq!(badness.start_of_bad_ts, 100);

        // Decay to zero clears it.
        for tick in 0..20 {
            badness.update(Usage::default(), Usage::new(100.0, 50.0), &cfg, 120 + tick * 10);
        }
        assert!(badness.is_good());
        assert_eq!(badness.start_of_bad_ts, 0);
    }

    #[test]
    fn reaches_violation_within_time_to_max_bad() {
        // Scenario: quota 100%, threshold 0.8, time_to_max_bad 60, refresh
        // 10, sustained 160% of a core. Six ticks must reach a violation.
        let cfg = test_config();
        let mut badness = Badness::zero(0);
        let mut violated_at = None;
        for tick in 1..=6 {
            badness.update(Usage::new(160.0, 0.0), Usage::new(100.0, 50.0), &cfg, tick * 10);
            if badness.is_violation() {
                violated_at = Some(tick * 10);
                break;
            }
        }
        assert!(violated_at.is_some_and(|t| t <= 60));
    }

    #[test]
    fn import_expiry() {
        let badness = Badness::imported(10.0, 0.0, 1000);
        assert!(!badness.expired(3600, 2000));
        assert!(!badness.expired(3600, 1000 + 3600));
        assert!(badness.expired(3600, 1000 + 3601));
        assert_eq!(badness.start_of_bad_ts, 1000);
        assert_eq!(Badness::imported(0.0, 0.0, 1000).start_of_bad_ts, 0);
    }
}
