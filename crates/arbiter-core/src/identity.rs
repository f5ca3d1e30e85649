//! User and group identity lookups.
//!
//! Not every uid with a session has a passwd entry (e.g. removed from LDAP
//! after login); callers must handle `None`. Lookups go through a TTL cache
//! since the collector asks for the same uids every tick.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long cached passwd entries stay fresh.
const CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// A resolved passwd entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub username: String,
    /// All gids of groups the user belongs to.
    pub gids: Vec<u32>,
}

/// Source of identity information, mockable for tests.
pub trait IdentitySource: Send + Sync {
    /// Resolves a uid to its passwd entry, or None if there is none.
    fn lookup_user(&self, uid: u32) -> Option<UserIdentity>;

    /// Resolves a gid to its group name.
    fn lookup_group_name(&self, gid: u32) -> Option<String>;
}

/// Identity source backed by the system passwd/group databases.
#[derive(Default)]
pub struct SystemIdentity {
    cache: Mutex<HashMap<u32, (Instant, Option<UserIdentity>)>>,
}

impl SystemIdentity {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentitySource for SystemIdentity {
    fn lookup_user(&self, uid: u32) -> Option<UserIdentity> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((cached_at, entry)) = cache.get(&uid)
            && cached_at.elapsed() < CACHE_TTL
        {
            return entry.clone();
        }

        let entry = uzers::get_user_by_uid(uid).map(|user| {
            let username = user.name().to_string_lossy().into_owned();
            let gids = uzers::get_user_groups(&username, user.primary_group_id())
                .unwrap_or_default()
                .iter()
                .map(|g| g.gid())
                .collect();
            UserIdentity { username, gids }
        });
        cache.insert(uid, (Instant::now(), entry.clone()));
        entry
    }

    fn lookup_group_name(&self, gid: u32) -> Option<String> {
        uzers::get_group_by_gid(gid).map(|g| g.name().to_string_lossy().into_owned())
    }
}

/// Fixed identity table for tests.
#[derive(Debug, Default, Clone)]
pub struct FixedIdentity {
    users: HashMap<u32, UserIdentity>,
    groups: HashMap<u32, String>,
}

impl FixedIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, uid: u32, username: &str, gids: &[u32]) -> Self {
        self.users.insert(
            uid,
            UserIdentity {
                username: username.to_string(),
                gids: gids.to_vec(),
            },
        );
        self
    }

    pub fn with_group(mut self, gid: u32, name: &str) -> Self {
        self.groups.insert(gid, name.to_string());
        self
    }
}

impl IdentitySource for FixedIdentity {
    fn lookup_user(&self, uid: u32) -> Option<UserIdentity> {
        self.users.get(&uid).cloned()
    }

    fn lookup_group_name(&self, gid: u32) -> Option<String> {
        self.groups.get(&gid).cloned()
    }
}
