//! The shared status store.
//!
//! A single logical relation keyed by `(uid, hostname)` within a sync
//! group, plus a parallel badness relation. Every arbiter instance owns
//! exactly the rows under its own hostname; peer rows are read-only. The
//! core depends only on the `StatusStore` trait; `PostgresStore` backs it
//! with a shared server and `MemoryStore` backs tests and single-host
//! operation.
//!
//! Two integrity rules are enforced by `StoreHandle`, not the database:
//! a non-authoritative status is never persisted for our host, and a zero
//! badness is never persisted for our host. Rows violating either rule
//! are deleted as soon as the violation appears.

mod memory;
mod postgres;
pub mod sync;

pub use memory::{MemoryStore, SharedState};
pub use postgres::PostgresStore;

use crate::badness::Badness;
use crate::status::Status;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Error type for store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Connection lost, deadlock, timeout; worth retrying.
    Transient(String),
    /// Unknown columns or incompatible types; fatal at startup.
    Schema(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Transient(msg) => write!(f, "transient store error: {}", msg),
            StoreError::Schema(msg) => write!(f, "schema error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Outcome of `ensure_tables`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Whether any table was created fresh.
    pub created: bool,
    /// Whether a pre-v3 table was renamed aside to `old_<name>`.
    pub migrated: bool,
}

/// Operations the core needs from a status store backend.
///
/// Implementations are scoped to one `(hostname, sync_group)` identity:
/// loads filter by sync group, writes and deletes apply to our host's rows
/// only, and `load_badness` additionally filters to our own hostname.
pub trait StatusStore: Send {
    /// Creates or migrates tables to the v3 schema. Pre-v3 tables are
    /// renamed aside with an `old_` prefix rather than altered in place,
    /// keeping the migration idempotent across engines. Afterwards, rows
    /// for our host with a mismatched sync group are removed.
    fn ensure_tables(&mut self) -> Result<MigrationOutcome, StoreError>;

    /// All status rows in our sync group: uid -> hostname -> status, with
    /// each status's authority set to its row's hostname.
    fn load_statuses(&mut self) -> Result<BTreeMap<u32, BTreeMap<String, Status>>, StoreError>;

    /// Badness rows for our own host and sync group.
    fn load_badness(&mut self) -> Result<BTreeMap<u32, Badness>, StoreError>;

    /// Upserts status rows under our hostname, atomically per batch.
    fn upsert_statuses(&mut self, rows: &[(u32, Status)]) -> Result<(), StoreError>;

    /// Upserts badness rows under our hostname, atomically per batch.
    fn upsert_badness(&mut self, rows: &[(u32, Badness)]) -> Result<(), StoreError>;

    /// Deletes our host's status row for the uid.
    fn delete_status(&mut self, uid: u32) -> Result<(), StoreError>;

    /// Deletes our host's badness row for the uid.
    fn delete_badness(&mut self, uid: u32) -> Result<(), StoreError>;

    /// The hostnames present in the last successful `load_statuses`,
    /// ours included.
    fn known_syncing_hosts(&self) -> Vec<String>;
}

impl StatusStore for Box<dyn StatusStore> {
    fn ensure_tables(&mut self) -> Result<MigrationOutcome, StoreError> {
        (**self).ensure_tables()
    }

    fn load_statuses(&mut self) -> Result<BTreeMap<u32, BTreeMap<String, Status>>, StoreError> {
        (**self).load_statuses()
    }

    fn load_badness(&mut self) -> Result<BTreeMap<u32, Badness>, StoreError> {
        (**self).load_badness()
    }

    fn upsert_statuses(&mut self, rows: &[(u32, Status)]) -> Result<(), StoreError> {
        (**self).upsert_statuses(rows)
    }

    fn upsert_badness(&mut self, rows: &[(u32, Badness)]) -> Result<(), StoreError> {
        (**self).upsert_badness(rows)
    }

    fn delete_status(&mut self, uid: u32) -> Result<(), StoreError> {
        (**self).delete_status(uid)
    }

    fn delete_badness(&mut self, uid: u32) -> Result<(), StoreError> {
        (**self).delete_badness(uid)
    }

    fn known_syncing_hosts(&self) -> Vec<String> {
        (**self).known_syncing_hosts()
    }
}

/// Number of attempts for a store operation before giving up on the tick.
const RETRY_TRIES: u32 = 3;
/// Initial backoff between attempts; doubles each retry.
const RETRY_START: Duration = Duration::from_millis(200);

/// Wraps a backend with the persistence invariants, bounded retries and
/// bookkeeping of which of our rows exist, so deletes are only issued for
/// rows known to be present.
pub struct StoreHandle<S: StatusStore> {
    store: S,
    hostname: String,
    stored_status_uids: HashSet<u32>,
    stored_badness_uids: HashSet<u32>,
    retry_start: Duration,
}

impl<S: StatusStore> StoreHandle<S> {
    pub fn new(store: S, hostname: impl Into<String>) -> Self {
        Self {
            store,
            hostname: hostname.into(),
            stored_status_uids: HashSet::new(),
            stored_badness_uids: HashSet::new(),
            retry_start: RETRY_START,
        }
    }

    /// Disables retry sleeps; tests only.
    pub fn without_retry_delay(mut self) -> Self {
        self.retry_start = Duration::ZERO;
        self
    }

    pub fn store(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn known_syncing_hosts(&self) -> Vec<String> {
        let mut hosts = self.store.known_syncing_hosts();
        if !hosts.iter().any(|h| h == &self.hostname) {
            hosts.push(self.hostname.clone());
        }
        hosts.sort();
        hosts
    }

    fn with_retry<T>(
        &mut self,
        mut op: impl FnMut(&mut S) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut delay = self.retry_start;
        let mut last_err = None;
        for attempt in 1..=RETRY_TRIES {
            match op(&mut self.store) {
                Ok(value) => return Ok(value),
                Err(err @ StoreError::Schema(_)) => return Err(err),
                Err(err) => {
                    debug!(attempt = attempt, error = %err, "store operation failed");
                    last_err = Some(err);
                    if attempt < RETRY_TRIES && !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    delay *= 2;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::Transient("retries exhausted".into())))
    }

    pub fn ensure_tables(&mut self) -> Result<MigrationOutcome, StoreError> {
        self.with_retry(|store| store.ensure_tables())
    }

    /// Loads every status row in the sync group, remembering which uids
    /// have a row under our host.
    pub fn load_raw_statuses(
        &mut self,
    ) -> Result<BTreeMap<u32, BTreeMap<String, Status>>, StoreError> {
        let raw = self.with_retry(|store| store.load_statuses())?;
        for (uid, hosts) in &raw {
            if hosts.contains_key(&self.hostname) {
                self.stored_status_uids.insert(*uid);
            }
        }
        Ok(raw)
    }

    /// Loads our host's badness rows, remembering which uids are stored.
    pub fn load_badness(&mut self) -> Result<BTreeMap<u32, Badness>, StoreError> {
        let rows = self.with_retry(|store| store.load_badness())?;
        self.stored_badness_uids.extend(rows.keys().copied());
        Ok(rows)
    }

    /// Persists statuses, applying the integrity rules: rows that are
    /// non-authoritative or empty (current == default with zero
    /// occurrences) are not written, and are deleted when previously
    /// stored.
    pub fn write_statuses(&mut self, statuses: &[(u32, Status)]) -> Result<(), StoreError> {
        let mut upserts = Vec::new();
        for (uid, status) in statuses {
            if self.status_should_persist(status) {
                self.stored_status_uids.insert(*uid);
                upserts.push((*uid, status.clone()));
            } else if self.stored_status_uids.contains(uid) {
                self.with_retry(|store| store.delete_status(*uid))?;
                self.stored_status_uids.remove(uid);
            }
        }
        if !upserts.is_empty() {
            self.with_retry(|store| store.upsert_statuses(&upserts))?;
        }
        Ok(())
    }

    /// Persists badness, deleting rows whose score returned to zero.
    pub fn write_badness(&mut self, badness: &[(u32, Badness)]) -> Result<(), StoreError> {
        let mut upserts = Vec::new();
        for (uid, score) in badness {
            if score.is_bad() {
                self.stored_badness_uids.insert(*uid);
                upserts.push((*uid, *score));
            } else if self.stored_badness_uids.contains(uid) {
                self.with_retry(|store| store.delete_badness(*uid))?;
                self.stored_badness_uids.remove(uid);
            }
        }
        if !upserts.is_empty() {
            self.with_retry(|store| store.upsert_badness(&upserts))?;
        }
        Ok(())
    }

    /// Deletes a stored badness row outright, as when an imported score
    /// has expired.
    pub fn remove_badness(&mut self, uid: u32) -> Result<(), StoreError> {
        self.with_retry(|store| store.delete_badness(uid))?;
        self.stored_badness_uids.remove(&uid);
        Ok(())
    }

    /// Re-reads both relations and deletes rows violating the integrity
    /// rules. Needed because crashes between a state change and its write
    /// can leave rows behind that the normal write path never revisits.
    pub fn cleanup(&mut self) -> Result<(), StoreError> {
        let raw = self.load_raw_statuses()?;
        for (uid, hosts) in raw {
            if let Some(status) = hosts.get(&self.hostname)
                && !self.status_should_persist(status)
            {
                self.with_retry(|store| store.delete_status(uid))?;
                self.stored_status_uids.remove(&uid);
            }
        }
        let badness = self.load_badness()?;
        for (uid, score) in badness {
            if !score.is_bad() {
                self.with_retry(|store| store.delete_badness(uid))?;
                self.stored_badness_uids.remove(&uid);
            }
        }
        Ok(())
    }

    fn status_should_persist(&self, status: &Status) -> bool {
        // Non-authoritative statuses stay out of the store so a host that
        // fails never claims mail authority it adopted from a peer; empty
        // statuses stay out because they carry no information.
        status.authoritative(&self.hostname)
            && !(status.current == status.default && status.occurrences == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(current: &str, default: &str, occurrences: u32, authority: &str) -> Status {
        Status {
            current: current.into(),
            default: default.into(),
            occurrences,
            timestamp: 100,
            occur_timestamp: 100,
            authority: authority.into(),
        }
    }

    fn handle() -> StoreHandle<MemoryStore> {
        let shared = MemoryStore::shared();
        StoreHandle::new(
            MemoryStore::new(shared, "node1", "cluster1"),
            "node1",
        )
        .without_retry_delay()
    }

    #[test]
    fn empty_and_foreign_statuses_are_not_persisted() {
        let mut handle = handle();
        handle
            .write_statuses(&[
                (1000, status("penalty1", "normal", 1, "node1")),
                (1001, status("normal", "normal", 0, "node1")), // empty
                (1002, status("penalty1", "normal", 1, "node2")), // foreign
            ])
            .unwrap();

        let raw = handle.load_raw_statuses().unwrap();
        assert!(raw.contains_key(&1000));
        assert!(!raw.contains_key(&1001));
        assert!(!raw.contains_key(&1002));
    }

    #[test]
    fn rows_are_deleted_when_invariants_become_true() {
        let mut handle = handle();
        handle
            .write_statuses(&[(1000, status("penalty1", "normal", 1, "node1"))])
            .unwrap();
        assert!(handle.load_raw_statuses().unwrap().contains_key(&1000));

        // Back to empty: the stored row must go away.
        handle
            .write_statuses(&[(1000, status("normal", "normal", 0, "node1"))])
            .unwrap();
        assert!(handle.load_raw_statuses().unwrap().is_empty());
    }

    #[test]
    fn zero_badness_is_never_persisted() {
        let mut handle = handle();
        handle
            .write_badness(&[(1000, Badness::imported(5.0, 0.0, 100))])
            .unwrap();
        assert!(handle.load_badness().unwrap().contains_key(&1000));

        handle
            .write_badness(&[(1000, Badness::zero(200))])
            .unwrap();
        assert!(handle.load_badness().unwrap().is_empty());
    }

    #[test]
    fn cleanup_removes_leftover_rows() {
        let shared = MemoryStore::shared();
        // Simulate a crashed instance that left an empty status and a zero
        // badness behind by writing through the raw backend.
        {
            let mut raw = MemoryStore::new(shared.clone(), "node1", "cluster1");
            raw.upsert_statuses(&[(1000, status("normal", "normal", 0, "node1"))])
                .unwrap();
            raw.upsert_badness(&[(1000, Badness::zero(100))]).unwrap();
        }
        let mut handle = StoreHandle::new(
            MemoryStore::new(shared, "node1", "cluster1"),
            "node1",
        )
        .without_retry_delay();

        handle.cleanup().unwrap();
        assert!(handle.load_raw_statuses().unwrap().is_empty());
        assert!(handle.load_badness().unwrap().is_empty());
    }

    #[test]
    fn transient_errors_are_retried() {
        let shared = MemoryStore::shared();
        let mut store = MemoryStore::new(shared, "node1", "cluster1");
        store.fail_next(2);
        let mut handle = StoreHandle::new(store, "node1").without_retry_delay();
        // Two failures then success within the three tries.
        assert!(handle.load_raw_statuses().is_ok());

        handle.store().fail_next(3);
        assert!(matches!(
            handle.load_raw_statuses(),
            Err(StoreError::Transient(_))
        ));
    }
}
