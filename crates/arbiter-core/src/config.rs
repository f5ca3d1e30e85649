//! Configuration loading, substitution and validation.
//!
//! The daemon consumes a single TOML file. String values support two
//! substitutions applied before parsing: `%H` expands to the local hostname
//! and `${VAR}` expands from the environment. After parsing, `validate()`
//! checks cross-field constraints; a failed validation is fatal at startup
//! (exit code 2) and never recoverable at runtime.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// Error type for configuration failures.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Io(std::io::Error),
    /// The TOML failed to deserialize.
    Parse(String),
    /// A cross-field constraint failed.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {}", e),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// Validated configuration snapshot consumed by every component.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    pub general: GeneralConfig,
    #[serde(rename = "self")]
    pub identity: IdentityConfig,
    pub badness: BadnessConfig,
    pub email: EmailConfig,
    pub database: DatabaseConfig,
    pub processes: ProcessesConfig,
    pub status: StatusConfig,
    pub high_usage_watcher: HighUsageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// When set, quotas are never written and emails go to admins only.
    #[serde(default)]
    pub debug_mode: bool,
    /// Seconds per refresh tick.
    pub arbiter_refresh: u64,
    /// How many recent history events make up the averaging window.
    pub history_per_refresh: usize,
    /// Sub-samples per refresh tick; at least 2.
    #[serde(default = "default_poll")]
    pub poll: u32,
    /// Uids below this are never tracked.
    #[serde(default = "default_min_uid")]
    pub min_uid: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Group that must own the exit file for it to trigger shutdown.
    pub groupname: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BadnessConfig {
    /// Ring buffer length for per-user history.
    pub max_history_kept: usize,
    /// Relative-usage threshold above which cpu badness grows, in (0, 1].
    pub cpu_badness_threshold: f64,
    /// Relative-usage threshold above which mem badness grows, in (0, 1].
    pub mem_badness_threshold: f64,
    /// Seconds of usage at quota for badness to reach 100.
    pub time_to_max_bad: f64,
    /// Seconds of zero usage for badness to fall back to 0.
    pub time_to_min_bad: f64,
    /// Cap usage at quota when computing deltas, shielding against
    /// erroneous samples.
    #[serde(default = "default_true")]
    pub cap_badness_incr: bool,
    /// Stored badness older than this many seconds is not imported.
    #[serde(default = "default_imported_badness_timeout")]
    pub imported_badness_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub from_email: String,
    pub admin_emails: Vec<String>,
    pub mail_server: String,
    #[serde(default)]
    pub keep_plots: bool,
    #[serde(default)]
    pub reply_to: String,
    #[serde(default)]
    pub plot_location: String,
    #[serde(default = "default_plot_process_cap")]
    pub plot_process_cap: usize,
    #[serde(default = "default_table_process_cap")]
    pub table_process_cap: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Directory for local log output.
    pub log_location: String,
    /// Days between log rotations.
    #[serde(default = "default_log_rotate_period")]
    pub log_rotate_period: u32,
    /// Connection URL of the shared status store. Empty selects the
    /// in-memory store (single-host operation, nothing survives restart).
    #[serde(default)]
    pub statusdb_url: String,
    /// Hosts sharing a sync group converge on each user's status.
    #[serde(default)]
    pub statusdb_sync_group: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessesConfig {
    /// Include swap in memory accounting and write memsw limits.
    #[serde(default)]
    pub memsw: bool,
    /// Read proportional-share memory from smaps (needs CAP_SYS_PTRACE).
    #[serde(default)]
    pub pss: bool,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub whitelist_file: String,
    /// Process owners whose processes are always whitelisted.
    #[serde(default)]
    pub proc_owner_whitelist: Vec<u32>,
    /// Whitelist the synthetic "other processes" residual entry.
    #[serde(default)]
    pub whitelist_other_processes: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    /// Status groups in matching order; first uid/gid match wins.
    pub order: Vec<String>,
    /// Group assigned when no other group matches.
    pub fallback_status: String,
    #[serde(default)]
    pub div_cpu_quotas_by_threads_per_core: bool,
    pub penalty: PenaltyConfig,
    /// Remaining keys are the status group tables themselves.
    #[serde(flatten)]
    pub groups: BTreeMap<String, StatusGroupConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PenaltyConfig {
    /// Penalty tiers from mildest to harshest; occurrences index into this.
    pub order: Vec<String>,
    /// Seconds of good behavior before occurrences decrement.
    pub occur_timeout: u64,
    /// Penalty quotas are ratios applied to the default group's quotas.
    #[serde(default = "default_true")]
    pub relative_quotas: bool,
    #[serde(flatten)]
    pub groups: BTreeMap<String, StatusGroupConfig>,
}

/// A status group table. Penalty groups additionally carry `timeout` and
/// `expression`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusGroupConfig {
    /// Percent of one core, or a unitless ratio for relative penalty quotas.
    pub cpu_quota: f64,
    /// Gigabytes, or a unitless ratio for relative penalty quotas.
    pub mem_quota: f64,
    #[serde(default)]
    pub uids: Vec<u32>,
    #[serde(default)]
    pub gids: Vec<u32>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub whitelist_file: String,
    /// Seconds a user stays in this penalty tier.
    #[serde(default)]
    pub timeout: u64,
    /// Severity label used in warning email subjects.
    #[serde(default)]
    pub expression: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HighUsageConfig {
    /// Master switch for the node-wide high usage watcher.
    #[serde(default)]
    pub high_usage_watcher: bool,
    /// Fraction of the machine's cores, in (0, 1].
    #[serde(default = "default_usage_threshold")]
    pub cpu_usage_threshold: f64,
    /// Fraction of the machine's memory, in (0, 1].
    #[serde(default = "default_usage_threshold")]
    pub mem_usage_threshold: f64,
    /// Top users listed in the notification.
    #[serde(default = "default_user_count")]
    pub user_count: usize,
    /// Consecutive ticks above threshold before alerting.
    #[serde(default = "default_threshold_period")]
    pub threshold_period: usize,
    /// Seconds between notifications.
    #[serde(default = "default_high_usage_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub div_cpu_thresholds_by_threads_per_core: bool,
}

fn default_poll() -> u32 {
    2
}
fn default_min_uid() -> u32 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_imported_badness_timeout() -> u64 {
    3600
}
fn default_plot_process_cap() -> usize {
    20
}
fn default_table_process_cap() -> usize {
    12
}
fn default_log_rotate_period() -> u32 {
    7
}
fn default_usage_threshold() -> f64 {
    0.8
}
fn default_user_count() -> usize {
    8
}
fn default_threshold_period() -> usize {
    1
}
fn default_high_usage_timeout() -> u64 {
    1800
}

impl CoreConfig {
    /// Parses configuration from a TOML string after applying `%H` and
    /// `${VAR}` substitutions.
    pub fn from_toml(raw: &str, hostname: &str) -> Result<Self, ConfigError> {
        let substituted = substitute(raw, hostname);
        let cfg: CoreConfig =
            toml::from_str(&substituted).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads and parses the configuration file at `path`.
    pub fn load(path: &str, hostname: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw, hostname)
    }

    /// Checks cross-field constraints the type system cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.general.arbiter_refresh < 5 {
            return invalid("general.arbiter_refresh must be at least 5 seconds".into());
        }
        if self.general.history_per_refresh < 1 {
            return invalid("general.history_per_refresh must be at least 1".into());
        }
        if self.general.poll < 2 {
            return invalid("general.poll must be at least 2".into());
        }
        for (name, value) in [
            ("cpu_badness_threshold", self.badness.cpu_badness_threshold),
            ("mem_badness_threshold", self.badness.mem_badness_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return invalid(format!("badness.{name} must be in (0, 1]"));
            }
        }
        if self.badness.time_to_max_bad <= 0.0 || self.badness.time_to_min_bad <= 0.0 {
            return invalid("badness.time_to_{max,min}_bad must be positive".into());
        }
        if self.status.order.is_empty() {
            return invalid("status.order must not be empty".into());
        }
        if !self.status.order.contains(&self.status.fallback_status) {
            return invalid(format!(
                "status.fallback_status '{}' is not in status.order",
                self.status.fallback_status
            ));
        }
        for name in &self.status.order {
            if !self.status.groups.contains_key(name) {
                return invalid(format!("status group '{name}' in order has no table"));
            }
        }
        if self.status.penalty.order.is_empty() {
            return invalid("status.penalty.order must not be empty".into());
        }
        for name in &self.status.penalty.order {
            let Some(group) = self.status.penalty.groups.get(name) else {
                return invalid(format!("penalty group '{name}' in order has no table"));
            };
            if group.timeout == 0 {
                return invalid(format!("penalty group '{name}' needs a nonzero timeout"));
            }
            if group.expression.is_empty() {
                return invalid(format!("penalty group '{name}' needs an expression"));
            }
        }
        Ok(())
    }

    /// Returns whether the named status group is a penalty group.
    pub fn is_penalty(&self, group: &str) -> bool {
        self.status.penalty.order.iter().any(|g| g == group)
    }

    /// Returns the tier index of a penalty group, or None if the group is
    /// not a penalty.
    pub fn penalty_index(&self, group: &str) -> Option<usize> {
        self.status.penalty.order.iter().position(|g| g == group)
    }

    /// Looks up the properties of a status or penalty group.
    pub fn status_group(&self, group: &str) -> Option<&StatusGroupConfig> {
        if self.is_penalty(group) {
            self.status.penalty.groups.get(group)
        } else {
            self.status.groups.get(group)
        }
    }

    /// Returns the configured timeout for a penalty group, or 0 for
    /// non-penalty groups.
    pub fn penalty_timeout(&self, group: &str) -> u64 {
        if self.is_penalty(group) {
            self.status_group(group).map(|g| g.timeout).unwrap_or(0)
        } else {
            0
        }
    }

    /// Looks up a user's default status group by uid and group membership,
    /// matching in `status.order` and falling back to `fallback_status`.
    pub fn default_status_group(&self, uid: u32, gids: &[u32]) -> &str {
        for name in &self.status.order {
            if let Some(group) = self.status.groups.get(name)
                && (group.uids.contains(&uid) || gids.iter().any(|g| group.gids.contains(g)))
            {
                return name;
            }
        }
        &self.status.fallback_status
    }
}

/// Replaces `%H` with the hostname and `${VAR}` with environment values.
/// Unset variables expand to the empty string.
fn substitute(raw: &str, hostname: &str) -> String {
    let mut out = raw.replace("%H", hostname);
    while let Some(start) = out.find("${") {
        let Some(end) = out[start..].find('}') else {
            break;
        };
        let var = &out[start + 2..start + end];
        let value = std::env::var(var).unwrap_or_default();
        out.replace_range(start..start + end + 1, &value);
    }
    out
}

#[cfg(test)]
pub(crate) fn test_config() -> CoreConfig {
    CoreConfig::from_toml(TEST_TOML, "node1").expect("test config parses")
}

#[cfg(test)]
pub(crate) const TEST_TOML: &str = r#"
[general]
debug_mode = false
arbiter_refresh = 10
history_per_refresh = 1
poll = 2
min_uid = 1000

[self]
groupname = "arbiter"

[badness]
max_history_kept = 60
cpu_badness_threshold = 0.8
mem_badness_threshold = 0.5
time_to_max_bad = 60
time_to_min_bad = 30
cap_badness_incr = false
imported_badness_timeout = 3600

[email]
from_email = "arbiter@%H"
admin_emails = ["root@localhost"]
mail_server = "localhost"
reply_to = ""
plot_location = "/tmp"
plot_process_cap = 20
table_process_cap = 8

[database]
log_location = "/tmp"
log_rotate_period = 7
statusdb_url = ""
statusdb_sync_group = "cluster1"

[processes]
memsw = false
pss = false
whitelist = ["gcc"]
whitelist_file = ""
proc_owner_whitelist = []
whitelist_other_processes = false

[status]
order = ["admin", "normal"]
fallback_status = "normal"
div_cpu_quotas_by_threads_per_core = false

[status.admin]
cpu_quota = 400.0
mem_quota = 8.0
uids = [900]

[status.normal]
cpu_quota = 100.0
mem_quota = 4.0

[status.penalty]
order = ["penalty1", "penalty2"]
occur_timeout = 600
relative_quotas = true

[status.penalty.penalty1]
cpu_quota = 0.8
mem_quota = 0.8
timeout = 300
expression = "new"

[status.penalty.penalty2]
cpu_quota = 0.5
mem_quota = 0.5
timeout = 900
expression = "repeated"

[high_usage_watcher]
high_usage_watcher = true
cpu_usage_threshold = 0.9
mem_usage_threshold = 0.9
user_count = 4
threshold_period = 2
timeout = 1800
div_cpu_thresholds_by_threads_per_core = false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_validates() {
        let cfg = test_config();
        assert_eq!(cfg.general.arbiter_refresh, 10);
        assert_eq!(cfg.status.order, vec!["admin", "normal"]);
        assert_eq!(cfg.status.penalty.order.len(), 2);
        assert!(cfg.is_penalty("penalty1"));
        assert!(!cfg.is_penalty("normal"));
        assert_eq!(cfg.penalty_index("penalty2"), Some(1));
        assert_eq!(cfg.penalty_timeout("penalty1"), 300);
        assert_eq!(cfg.penalty_timeout("normal"), 0);
    }

    #[test]
    fn hostname_substitution() {
        let cfg = test_config();
        assert_eq!(cfg.email.from_email, "arbiter@node1");
    }

    #[test]
    fn load_reads_and_substitutes_a_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TEST_TOML.as_bytes()).unwrap();
        let path = file.path().to_str().unwrap();

        let cfg = CoreConfig::load(path, "node9").unwrap();
        assert_eq!(cfg.email.from_email, "arbiter@node9");
        assert_eq!(cfg.identity.groupname, "arbiter");
    }

    #[test]
    fn load_missing_file_is_an_io_error() {
        assert!(matches!(
            CoreConfig::load("/nonexistent/arbiter.toml", "node1"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn env_substitution() {
        // SAFETY: test-only mutation of this process's environment.
        unsafe { std::env::set_var("ARBITER_TEST_GROUP", "wheel") };
        let raw = TEST_TOML.replace("groupname = \"arbiter\"", "groupname = \"${ARBITER_TEST_GROUP}\"");
        let cfg = CoreConfig::from_toml(&raw, "node1").unwrap();
        assert_eq!(cfg.identity.groupname, "wheel");
    }

    #[test]
    fn default_group_matches_uid_then_gid_then_fallback() {
        let cfg = test_config();
        assert_eq!(cfg.default_status_group(900, &[]), "admin");
        assert_eq!(cfg.default_status_group(1000, &[]), "normal");
    }

    #[test]
    fn rejects_low_poll() {
        let raw = TEST_TOML.replace("poll = 2", "poll = 1");
        assert!(matches!(
            CoreConfig::from_toml(&raw, "node1"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_penalty_without_timeout() {
        let raw = TEST_TOML.replace("timeout = 300", "timeout = 0");
        assert!(CoreConfig::from_toml(&raw, "node1").is_err());
    }

    #[test]
    fn rejects_unlisted_fallback() {
        let raw = TEST_TOML.replace("fallback_status = \"normal\"", "fallback_status = \"none\"");
        assert!(CoreConfig::from_toml(&raw, "node1").is_err());
    }
}
