//! Status groups and per-user status state.
//!
//! A user has exactly one *current* status group at any moment plus a
//! *default* group derived from configuration, an occurrences count mapping
//! into the penalty ladder, two change timestamps, and an authority: the
//! host that last promoted the user into the current state and therefore
//! the only host allowed to mail them about it.

use crate::config::CoreConfig;
use crate::hostfacts::HostFacts;
use std::collections::BTreeMap;
use std::fmt;

/// A user's status state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Current status group name.
    pub current: String,
    /// Default status group name, re-derived from configuration.
    pub default: String,
    /// Penalties still remembered; indexes into the penalty ladder.
    pub occurrences: u32,
    /// Epoch seconds of the last change to `current`.
    pub timestamp: i64,
    /// Epoch seconds of the last change to `occurrences`.
    pub occur_timestamp: i64,
    /// Host that last promoted the user into the current state.
    pub authority: String,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}, occur={}, ts={}, occur_ts={}, authority={}",
            self.current,
            self.default,
            self.occurrences,
            self.timestamp,
            self.occur_timestamp,
            self.authority
        )
    }
}

impl Status {
    /// The empty status for a user: default group on both sides, zero
    /// occurrences and timestamps. Empty statuses are never persisted.
    pub fn empty_for(cfg: &CoreConfig, uid: u32, gids: &[u32], hostname: &str) -> Self {
        let default = cfg.default_status_group(uid, gids).to_string();
        Self {
            current: default.clone(),
            default,
            occurrences: 0,
            timestamp: 0,
            occur_timestamp: 0,
            authority: hostname.to_string(),
        }
    }

    /// Whether this equals the user's empty status on the identifying
    /// fields (current, default, occurrences).
    pub fn is_empty(&self, cfg: &CoreConfig, uid: u32, gids: &[u32]) -> bool {
        let default = cfg.default_status_group(uid, gids);
        self.current == default && self.default == default && self.occurrences == 0
    }

    pub fn in_penalty(&self, cfg: &CoreConfig) -> bool {
        cfg.is_penalty(&self.current)
    }

    /// Whether this host may send user-visible mail for the current state.
    pub fn authoritative(&self, hostname: &str) -> bool {
        self.authority == hostname
    }

    /// Tier index into the penalty ladder, or None outside penalty.
    pub fn penalty_index(&self, cfg: &CoreConfig) -> Option<usize> {
        cfg.penalty_index(&self.current)
    }

    pub fn penalty_timeout(&self, cfg: &CoreConfig) -> u64 {
        cfg.penalty_timeout(&self.current)
    }

    /// Whether the timeout of the current penalty has elapsed. False
    /// outside penalty.
    pub fn penalty_expired(&self, cfg: &CoreConfig, now: i64) -> bool {
        self.in_penalty(cfg) && self.timestamp + (self.penalty_timeout(cfg) as i64) < now
    }

    pub fn has_occurrences(&self) -> bool {
        self.occurrences > 0
    }

    /// Whether the forgiveness window on occurrences has elapsed.
    pub fn occurrences_expired(&self, cfg: &CoreConfig, now: i64) -> bool {
        self.occur_timestamp + (cfg.status.penalty.occur_timeout as i64) < now
    }

    /// Moves the user up one penalty tier, capped at the last configured
    /// tier so further violations re-enter at the top. Claims authority.
    /// Returns the new status group name.
    pub fn upgrade_penalty(&mut self, cfg: &CoreConfig, hostname: &str, now: i64) -> String {
        let ladder = &cfg.status.penalty.order;
        self.occurrences = (self.occurrences + 1).min(ladder.len() as u32);
        self.current = ladder[self.occurrences as usize - 1].clone();
        self.timestamp = now;
        self.occur_timestamp = now;
        self.authority = hostname.to_string();
        self.current.clone()
    }

    /// Returns the user to their default group after a penalty expires.
    ///
    /// Authority is reclaimed even when another host imposed the penalty:
    /// each host lowers penalties independently as resilience against a
    /// peer failing to demote, and any state change that lowers user
    /// burden reclaims authority. The forgiveness timer restarts now so it
    /// counts from release, not from when the penalty began.
    pub fn downgrade_penalty(&mut self, hostname: &str, now: i64) -> String {
        self.current = self.default.clone();
        self.timestamp = now;
        self.occur_timestamp = now;
        self.authority = hostname.to_string();
        self.current.clone()
    }

    /// Forgives one occurrence. Also reclaims authority, for the same
    /// resilience reason as `downgrade_penalty`.
    pub fn lower_occurrences(&mut self, hostname: &str, now: i64) -> u32 {
        self.occurrences = self.occurrences.saturating_sub(1);
        self.occur_timestamp = now;
        self.authority = hostname.to_string();
        self.occurrences
    }

    /// Restarts the forgiveness window without changing occurrences.
    pub fn reset_occurrences_timeout(&mut self, now: i64) {
        self.occur_timestamp = now;
    }

    /// Sets the current group directly, clearing occurrences, with
    /// timestamps two refresh intervals in the future so the override wins
    /// the next `resolve_with_self` round. Used by operator tooling.
    pub fn override_group(&mut self, cfg: &CoreConfig, new_group: &str, now: i64) {
        self.current = new_group.to_string();
        self.occurrences = 0;
        self.timestamp = now + 2 * cfg.general.arbiter_refresh as i64;
        self.occur_timestamp = self.timestamp;
    }

    /// Re-derives the default group from configuration. When current and
    /// default were the same and both disagree with the configuration,
    /// both move; otherwise only the default does. The configuration is
    /// the ultimate source for a user's default status, the store is not.
    pub fn enforce_cfg_consistency(&mut self, cfg: &CoreConfig, uid: u32, gids: &[u32]) {
        let cfg_default = cfg.default_status_group(uid, gids);
        if self.default != cfg_default {
            if self.current == self.default {
                self.current = cfg_default.to_string();
            }
            self.default = cfg_default.to_string();
        }
    }

    /// Most recent of the two change timestamps.
    pub fn last_changed(&self) -> i64 {
        self.timestamp.max(self.occur_timestamp)
    }

    /// Adopts the store's row for our own host when it is newer, keeping
    /// authority with us. Lets operator tooling that edits the store take
    /// effect without a restart. Returns whether the row was adopted.
    pub fn resolve_with_self(&mut self, store_status: &Status, hostname: &str) -> bool {
        if store_status.last_changed() > self.last_changed() {
            self.current = store_status.current.clone();
            self.default = store_status.default.clone();
            self.occurrences = store_status.occurrences;
            self.timestamp = store_status.timestamp;
            self.occur_timestamp = store_status.occur_timestamp;
            self.authority = hostname.to_string();
            return true;
        }
        false
    }

    /// The ordered resolution predicate: whether this status beats
    /// `other`, checked top to bottom and short-circuiting:
    ///
    /// 1. other is in an expired penalty;
    /// 2. both in penalty and our tier is at least theirs;
    /// 3. our occurrences are higher;
    /// 4. occurrences tie and their forgiveness window expired;
    /// 5. we changed at least as recently.
    pub fn supersedes(&self, other: &Status, cfg: &CoreConfig, now: i64) -> bool {
        if other.in_penalty(cfg) {
            if other.penalty_expired(cfg, now) {
                return true;
            }
            if self.in_penalty(cfg) && self.penalty_index(cfg) >= other.penalty_index(cfg) {
                return true;
            }
        }

        if other.occurrences < self.occurrences {
            return true;
        }
        if other.occurrences == self.occurrences && other.occurrences_expired(cfg, now) {
            return true;
        }

        self.last_changed() >= other.last_changed()
    }

    /// Resolves the most severe valid status from peer rows into self and
    /// returns the hostname of the winning row. Authority moves to the
    /// winner only when it pushes us *into* penalty; it returns to us when
    /// the winner takes us *out* of penalty.
    pub fn resolve_with_peers(
        &mut self,
        peers: &BTreeMap<String, Status>,
        cfg: &CoreConfig,
        hostname: &str,
        now: i64,
    ) -> String {
        let was_in_penalty = self.in_penalty(cfg);
        let mut winner = self.clone();
        let mut winner_host = hostname.to_string();

        for (peer_host, peer_status) in peers {
            if winner.supersedes(peer_status, cfg, now) {
                continue;
            }
            winner = peer_status.clone();
            winner_host = peer_host.clone();
            self.current = peer_status.current.clone();
            self.default = peer_status.default.clone();
            self.occurrences = peer_status.occurrences;
            self.timestamp = peer_status.timestamp;
            self.occur_timestamp = peer_status.occur_timestamp;
        }

        let we_won = winner_host == hostname;
        if self.in_penalty(cfg) && !was_in_penalty && !we_won {
            self.authority = winner_host.clone();
        }
        if !self.in_penalty(cfg) && was_in_penalty {
            self.authority = hostname.to_string();
        }
        winner_host
    }

    /// Equality on the fields persisted to the store.
    pub fn same_persisted_fields(&self, other: &Status) -> bool {
        self.current == other.current
            && self.default == other.default
            && self.occurrences == other.occurrences
            && self.timestamp == other.timestamp
            && self.occur_timestamp == other.occur_timestamp
    }
}

/// Effective quotas for a user in `group`: cpu as percent of one core and
/// memory as percent of the machine. With relative penalty quotas the
/// configured penalty values are unitless ratios applied to the default
/// group's quotas.
pub fn quotas_for(
    cfg: &CoreConfig,
    facts: &HostFacts,
    group: &str,
    default_group: &str,
) -> (f64, f64) {
    let props = cfg.status_group(group).cloned().unwrap_or_default();
    let mut cpu = props.cpu_quota;
    let mut mem = facts.gb_to_pct(props.mem_quota);
    if cfg.status.div_cpu_quotas_by_threads_per_core {
        cpu /= facts.threads_per_core as f64;
    }

    if cfg.is_penalty(group) && cfg.status.penalty.relative_quotas {
        let default_props = cfg.status_group(default_group).cloned().unwrap_or_default();
        // Penalty values are ratios; rebuild from the default group.
        cpu = props.cpu_quota * default_props.cpu_quota;
        mem = props.mem_quota * facts.gb_to_pct(default_props.mem_quota);
        if cfg.status.div_cpu_quotas_by_threads_per_core {
            cpu /= facts.threads_per_core as f64;
        }
    }
    (cpu, mem)
}
