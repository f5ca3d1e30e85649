//! arbiterd - per-node usage supervisor.
//!
//! Watches logged-in users through cgroup accounting, scores sustained
//! over-quota usage, lowers cpu/memory limits on violations, emails the
//! affected user, and converges on a shared per-user status with the
//! other hosts in its sync group through a shared status store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use arbiter_core::collector::cgroup::CgroupAdapter;
use arbiter_core::collector::{Collector, FileSystem, RealFs};
use arbiter_core::config::CoreConfig;
use arbiter_core::enforcer::Enforcer;
use arbiter_core::hostfacts::HostFacts;
use arbiter_core::identity::SystemIdentity;
use arbiter_core::notifier::{Notifier, SmtpMailer};
use arbiter_core::store::{MemoryStore, PostgresStore, StatusStore, StoreHandle};
use arbiter_core::supervisor::Supervisor;
use arbiter_core::watcher::ExitFileWatcher;

/// Exit code for configuration or permission errors at startup.
const EXIT_CONFIG: i32 = 2;
/// Exit code when the exit file asks us to stop (128 + SIGTERM).
const EXIT_FILE_TRIGGERED: i32 = 143;

/// Per-node usage supervisor daemon.
#[derive(Parser)]
#[command(name = "arbiterd", about = "Per-node usage supervisor", version)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/arbiter/arbiter.toml")]
    config: String,

    /// Path to the cgroup hierarchy.
    #[arg(long, default_value = "/sys/fs/cgroup")]
    cgroup_path: String,

    /// Path to the proc filesystem.
    #[arg(long, default_value = "/proc")]
    proc_path: String,

    /// File whose group-owned touch makes the daemon exit with 143.
    #[arg(long)]
    exit_file: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("arbiterd={}", level).parse().expect("static directive"))
        .add_directive(format!("arbiter_core={}", level).parse().expect("static directive"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let fs = RealFs::new();

    let facts = match HostFacts::detect(&fs, &args.proc_path) {
        Ok(facts) => Arc::new(facts),
        Err(e) => {
            error!("could not read host facts from {}: {}", args.proc_path, e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let cfg = match CoreConfig::load(&args.config, &facts.hostname) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("{}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    info!("arbiterd {} starting on {}", env!("CARGO_PKG_VERSION"), facts.hostname);
    info!(
        "Config: refresh={}s, poll={}, min_uid={}, sync_group={}",
        cfg.general.arbiter_refresh,
        cfg.general.poll,
        cfg.general.min_uid,
        cfg.database.statusdb_sync_group
    );
    if cfg.general.debug_mode {
        info!("Debug mode: quotas will not be set and emails go to admins");
    }

    // The hierarchy must exist up front; a missing mount is a setup
    // problem, not something a later tick can fix.
    let user_slice = format!("{}/systemd/user.slice", args.cgroup_path);
    if !fs.exists(std::path::Path::new(&user_slice)) {
        error!(
            "cgroup hierarchy not found at {} (is cgroup v1 accounting enabled?)",
            user_slice
        );
        std::process::exit(EXIT_CONFIG);
    }

    let identity = Arc::new(SystemIdentity::new());

    let store: Box<dyn StatusStore> = if cfg.database.statusdb_url.is_empty() {
        warn!("statusdb_url is empty; using the in-memory store (no peer sync, no restarts)");
        Box::new(MemoryStore::new(
            MemoryStore::shared(),
            facts.hostname.clone(),
            cfg.database.statusdb_sync_group.clone(),
        ))
    } else {
        Box::new(PostgresStore::new(
            cfg.database.statusdb_url.clone(),
            facts.hostname.clone(),
            cfg.database.statusdb_sync_group.clone(),
        ))
    };
    let store = StoreHandle::new(store, facts.hostname.clone());

    let collector = Collector::new(
        cfg.clone(),
        facts.clone(),
        fs,
        &args.cgroup_path,
        &args.proc_path,
        identity.clone(),
    );
    let enforcer = Enforcer::new(
        CgroupAdapter::new(fs, &args.cgroup_path),
        facts.clone(),
        cfg.processes.memsw,
    );
    let notifier = Notifier::new(
        cfg.email.clone(),
        cfg.general.debug_mode,
        SmtpMailer::new(cfg.email.mail_server.clone()),
    );

    let exit_groupname = cfg.identity.groupname.clone();
    let mut supervisor = Supervisor::new(cfg, facts.clone(), collector, enforcer, store, notifier);
    if let Err(e) = supervisor.prime() {
        error!("status store is unusable: {}", e);
        std::process::exit(EXIT_CONFIG);
    }

    let mut exit_file = args
        .exit_file
        .as_ref()
        .map(|path| ExitFileWatcher::new(fs, path, exit_groupname, identity));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("failed to set signal handler: {}", e);
    }

    info!("starting the evaluation loop");
    let mut tick_count: u64 = 0;
    while running.load(Ordering::SeqCst) {
        let now = chrono::Utc::now().timestamp();
        let summary = supervisor.tick(now);
        tick_count += 1;

        if !summary.upgraded.is_empty() || !summary.downgraded.is_empty() {
            info!(
                "Tick #{}: {} users, {} penalized, {} released, {} adopted",
                tick_count,
                summary.users_tracked,
                summary.upgraded.len(),
                summary.downgraded.len(),
                summary.adopted
            );
        } else if tick_count.is_multiple_of(30) {
            info!("Tick #{}: {} users tracked", tick_count, summary.users_tracked);
        }

        if let Some(watcher) = exit_file.as_mut()
            && watcher.triggered()
        {
            std::process::exit(EXIT_FILE_TRIGGERED);
        }
    }

    info!("shutdown complete");
}
