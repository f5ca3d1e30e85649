//! In-memory status store.
//!
//! Backs tests and single-host operation (empty `statusdb_url`). The state
//! is shared behind a mutex so multi-host synchronization tests can point
//! several `MemoryStore` views with different hostnames at one relation.

use crate::badness::Badness;
use crate::status::Status;
use crate::store::{MigrationOutcome, StatusStore, StoreError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct Relation {
    /// (uid, hostname) -> (status, sync_group)
    statuses: BTreeMap<(u32, String), (Status, String)>,
    /// (uid, hostname) -> (badness, sync_group)
    badness: BTreeMap<(u32, String), (Badness, String)>,
}

/// The relation shared between `MemoryStore` views.
pub type SharedState = Arc<Mutex<Relation>>;

/// One host's view of the shared in-memory relation.
pub struct MemoryStore {
    state: SharedState,
    hostname: String,
    sync_group: String,
    fail_next: u32,
    known_hosts: Vec<String>,
}

impl MemoryStore {
    /// Creates a relation to share between views.
    pub fn shared() -> SharedState {
        Arc::new(Mutex::new(Relation::default()))
    }

    pub fn new(state: SharedState, hostname: impl Into<String>, sync_group: impl Into<String>) -> Self {
        Self {
            state,
            hostname: hostname.into(),
            sync_group: sync_group.into(),
            fail_next: 0,
            known_hosts: Vec::new(),
        }
    }

    /// Makes the next `count` operations fail with a transient error.
    pub fn fail_next(&mut self, count: u32) {
        self.fail_next = count;
    }

    fn check_failure(&mut self) -> Result<(), StoreError> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(StoreError::Transient("injected failure".into()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Relation> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl StatusStore for MemoryStore {
    fn ensure_tables(&mut self) -> Result<MigrationOutcome, StoreError> {
        self.check_failure()?;
        // Nothing to create; still perform the sync-group side-cleanup.
        let hostname = self.hostname.clone();
        let sync_group = self.sync_group.clone();
        let mut state = self.lock();
        state
            .statuses
            .retain(|(_, host), (_, group)| *host != hostname || *group == sync_group);
        state
            .badness
            .retain(|(_, host), (_, group)| *host != hostname || *group == sync_group);
        Ok(MigrationOutcome {
            created: false,
            migrated: false,
        })
    }

    fn load_statuses(&mut self) -> Result<BTreeMap<u32, BTreeMap<String, Status>>, StoreError> {
        self.check_failure()?;
        let sync_group = self.sync_group.clone();
        let mut result: BTreeMap<u32, BTreeMap<String, Status>> = BTreeMap::new();
        let mut hosts = Vec::new();
        {
            let state = self.lock();
            for ((uid, hostname), (status, group)) in &state.statuses {
                if group != &sync_group {
                    continue;
                }
                let mut status = status.clone();
                status.authority = hostname.clone();
                result.entry(*uid).or_default().insert(hostname.clone(), status);
                if !hosts.contains(hostname) {
                    hosts.push(hostname.clone());
                }
            }
        }
        self.known_hosts = hosts;
        Ok(result)
    }

    fn load_badness(&mut self) -> Result<BTreeMap<u32, Badness>, StoreError> {
        self.check_failure()?;
        let state = self.lock();
        Ok(state
            .badness
            .iter()
            .filter(|((_, host), (_, group))| host == &self.hostname && group == &self.sync_group)
            .map(|((uid, _), (badness, _))| (*uid, *badness))
            .collect())
    }

    fn upsert_statuses(&mut self, rows: &[(u32, Status)]) -> Result<(), StoreError> {
        self.check_failure()?;
        let hostname = self.hostname.clone();
        let sync_group = self.sync_group.clone();
        let mut state = self.lock();
        for (uid, status) in rows {
            state
                .statuses
                .insert((*uid, hostname.clone()), (status.clone(), sync_group.clone()));
        }
        Ok(())
    }

    fn upsert_badness(&mut self, rows: &[(u32, Badness)]) -> Result<(), StoreError> {
        self.check_failure()?;
        let hostname = self.hostname.clone();
        let sync_group = self.sync_group.clone();
        let mut state = self.lock();
        for (uid, badness) in rows {
            state
                .badness
                .insert((*uid, hostname.clone()), (*badness, sync_group.clone()));
        }
        Ok(())
    }

    fn delete_status(&mut self, uid: u32) -> Result<(), StoreError> {
        self.check_failure()?;
        let key = (uid, self.hostname.clone());
        self.lock().statuses.remove(&key);
        Ok(())
    }

    fn delete_badness(&mut self, uid: u32) -> Result<(), StoreError> {
        self.check_failure()?;
        let key = (uid, self.hostname.clone());
        self.lock().badness.remove(&key);
        Ok(())
    }

    fn known_syncing_hosts(&self) -> Vec<String> {
        self.known_hosts.clone()
    }
}
