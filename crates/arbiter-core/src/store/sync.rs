//! Multi-host status synchronization.
//!
//! Every host evaluates its users independently each tick and then
//! reconciles against what the other hosts in the sync group believe,
//! always picking the most up-to-date status. The resilience of the
//! scheme comes from that independence: if the host where a penalty was
//! raised crashes, the others still expire the penalty on their own and
//! the user never stays throttled forever.
//!
//! There is a read-modify-write race against peers updating their rows
//! concurrently, but each host writes only its own `(uid, hostname)`
//! slice, reads and writes are atomic, and a row that loses the race
//! simply looks out of date to peers for roughly one refresh interval.
//!
//! Assumed (not enforced): hosts in a sync group run the same version and
//! configuration, and their wall clocks agree within a few seconds.

use crate::status::Status;
use crate::store::{StatusStore, StoreError, StoreHandle};
use crate::config::CoreConfig;
use std::collections::BTreeMap;
use tracing::debug;

/// A status replaced during peer reconciliation.
#[derive(Debug, Clone)]
pub struct Adoption {
    pub uid: u32,
    /// Host whose row won the resolution.
    pub from_host: String,
    /// Whether the adoption moved the user into penalty here.
    pub entered_penalty: bool,
    /// Whether the adoption moved the user out of penalty here.
    pub left_penalty: bool,
}

/// Reconciles in-memory statuses against the shared store.
pub struct Synchronizer {
    hostname: String,
}

impl Synchronizer {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    /// Adopts the store's own-host rows when they are newer than memory,
    /// so operator tooling that edits the store takes effect without a
    /// restart. Returns the uids that adopted a row.
    pub fn sync_from_self<S: StatusStore>(
        &self,
        handle: &mut StoreHandle<S>,
        statuses: &mut BTreeMap<u32, Status>,
    ) -> Result<Vec<u32>, StoreError> {
        let raw = handle.load_raw_statuses()?;
        let mut adopted = Vec::new();
        let mut modified = Vec::new();
        for (uid, status) in statuses.iter_mut() {
            let Some(store_row) = raw.get(uid).and_then(|hosts| hosts.get(&self.hostname))
            else {
                continue;
            };
            let before = status.clone();
            if status.resolve_with_self(store_row, &self.hostname) {
                debug!(
                    uid = *uid,
                    "store sync: replacing local status ({before}) with our stored row ({status})"
                );
                adopted.push(*uid);
            }
            modified.push((*uid, status.clone()));
        }
        handle.write_statuses(&modified)?;
        Ok(adopted)
    }

    /// Resolves each user's status against every peer row, writes back the
    /// rows that changed, and deletes rows whose post-sync state is empty
    /// for our host. Returns the adoptions that took place along with the
    /// raw peer rows that were read.
    pub fn sync_from_peers<S: StatusStore>(
        &self,
        handle: &mut StoreHandle<S>,
        statuses: &mut BTreeMap<u32, Status>,
        cfg: &CoreConfig,
        now: i64,
    ) -> Result<(Vec<Adoption>, BTreeMap<u32, BTreeMap<String, Status>>), StoreError> {
        let raw = handle.load_raw_statuses()?;
        let mut adoptions = Vec::new();
        let mut modified = Vec::new();

        for (uid, status) in statuses.iter_mut() {
            let before = status.clone();
            let peers = raw.get(uid).cloned().unwrap_or_default();
            let winner = status.resolve_with_peers(&peers, cfg, &self.hostname, now);

            if before.same_persisted_fields(status) {
                continue;
            }

            let entered_penalty = status.in_penalty(cfg) && !before.in_penalty(cfg);
            let left_penalty = !status.in_penalty(cfg) && before.in_penalty(cfg);
            if winner == self.hostname {
                debug!(uid = *uid, "store sync: updating ({before}) to ({status})");
            } else {
                debug!(
                    uid = *uid,
                    "store sync: replacing ({before}) with {winner}'s ({status})"
                );
            }
            adoptions.push(Adoption {
                uid: *uid,
                from_host: winner,
                entered_penalty,
                left_penalty,
            });
            modified.push((*uid, status.clone()));
        }

        handle.write_statuses(&modified)?;
        Ok((adoptions, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::store::MemoryStore;

    fn handle_for(host: &str, shared: crate::store::SharedState) -> StoreHandle<MemoryStore> {
        StoreHandle::new(MemoryStore::new(shared, host, "cluster1"), host).without_retry_delay()
    }

    fn empty(cfg: &CoreConfig, host: &str) -> Status {
        Status::empty_for(cfg, 1000, &[], host)
    }

    #[test]
    fn peer_penalty_is_adopted_without_authority() {
        let cfg = test_config();
        let shared = MemoryStore::shared();

        // Host A raised a penalty at t=100 and stored its row.
        let mut handle_a = handle_for("nodeA", shared.clone());
        let mut status_a = empty(&cfg, "nodeA");
        status_a.upgrade_penalty(&cfg, "nodeA", 100);
        handle_a.write_statuses(&[(1000, status_a)]).unwrap();

        // Host B syncs at t=110 with an empty local status.
        let mut handle_b = handle_for("nodeB", shared);
        let sync = Synchronizer::new("nodeB");
        let mut statuses = BTreeMap::from([(1000, empty(&cfg, "nodeB"))]);
        let (adoptions, _) = sync
            .sync_from_peers(&mut handle_b, &mut statuses, &cfg, 110)
            .unwrap();

        assert_eq!(adoptions.len(), 1);
        assert_eq!(adoptions[0].from_host, "nodeA");
        assert!(adoptions[0].entered_penalty);
        let status = &statuses[&1000];
        assert_eq!(status.current, "penalty1");
        assert_eq!(status.occurrences, 1);
        assert_eq!(status.authority, "nodeA");

        // Non-authoritative: host B must not have stored a row.
        let raw = handle_b.load_raw_statuses().unwrap();
        assert!(!raw[&1000].contains_key("nodeB"));
    }

    #[test]
    fn crashed_peer_penalty_expires_here() {
        let cfg = test_config();
        let shared = MemoryStore::shared();

        // Host A put the user in penalty at t=100, then crashed leaving
        // its row behind.
        let mut handle_a = handle_for("nodeA", shared.clone());
        let mut status_a = empty(&cfg, "nodeA");
        status_a.upgrade_penalty(&cfg, "nodeA", 100);
        handle_a.write_statuses(&[(1000, status_a.clone())]).unwrap();

        // Host B adopted the penalty earlier and now sees it expired.
        let mut handle_b = handle_for("nodeB", shared);
        let sync = Synchronizer::new("nodeB");
        let mut adopted = status_a.clone();
        adopted.authority = "nodeA".to_string();
        let mut statuses = BTreeMap::from([(1000, adopted)]);

        // B's own evaluation downgrades the expired penalty first, then
        // peer sync must not resurrect A's stale row (resolution rule 1).
        let now = 100 + 300 + 10;
        statuses.get_mut(&1000).map(|s| s.downgrade_penalty("nodeB", now));
        sync.sync_from_peers(&mut handle_b, &mut statuses, &cfg, now)
            .unwrap();

        let status = &statuses[&1000];
        assert!(!status.in_penalty(&cfg));
        assert_eq!(status.authority, "nodeB");
    }

    #[test]
    fn sync_from_self_adopts_external_edit() {
        let cfg = test_config();
        let shared = MemoryStore::shared();

        // Operator tooling wrote an override row under our hostname.
        let mut other_view = handle_for("node1", shared.clone());
        let mut override_row = empty(&cfg, "node1");
        override_row.current = "penalty1".into();
        override_row.occurrences = 1;
        override_row.timestamp = 500;
        override_row.occur_timestamp = 500;
        other_view.write_statuses(&[(1000, override_row)]).unwrap();

        let mut handle = handle_for("node1", shared);
        let sync = Synchronizer::new("node1");
        let mut statuses = BTreeMap::from([(1000, empty(&cfg, "node1"))]);
        let adopted = sync.sync_from_self(&mut handle, &mut statuses).unwrap();

        assert_eq!(adopted, vec![1000]);
        assert_eq!(statuses[&1000].current, "penalty1");
        assert_eq!(statuses[&1000].authority, "node1");
    }

    #[test]
    fn sync_is_idempotent_without_peer_writes() {
        let cfg = test_config();
        let shared = MemoryStore::shared();
        let mut handle_a = handle_for("nodeA", shared.clone());
        let mut status_a = empty(&cfg, "nodeA");
        status_a.upgrade_penalty(&cfg, "nodeA", 100);
        handle_a.write_statuses(&[(1000, status_a)]).unwrap();

        let mut handle_b = handle_for("nodeB", shared);
        let sync = Synchronizer::new("nodeB");
        let mut statuses = BTreeMap::from([(1000, empty(&cfg, "nodeB"))]);
        sync.sync_from_peers(&mut handle_b, &mut statuses, &cfg, 110)
            .unwrap();
        let first = statuses[&1000].clone();

        let (adoptions, _) = sync
            .sync_from_peers(&mut handle_b, &mut statuses, &cfg, 111)
            .unwrap();
        assert!(adoptions.is_empty());
        assert_eq!(statuses[&1000], first);
    }

    #[test]
    fn post_sync_empty_rows_are_deleted() {
        let cfg = test_config();
        let shared = MemoryStore::shared();

        // We believe the user is in penalty, and our row says so.
        let mut handle = handle_for("node1", shared.clone());
        let mut ours = empty(&cfg, "node1");
        ours.upgrade_penalty(&cfg, "node1", 100);
        handle.write_statuses(&[(1000, ours.clone())]).unwrap();

        // An operator clears the user by writing an empty row with a newer
        // timestamp straight into the store.
        {
            use crate::store::StatusStore;
            let mut raw = MemoryStore::new(shared, "node1", "cluster1");
            let mut cleared = empty(&cfg, "node1");
            cleared.timestamp = 900;
            cleared.occur_timestamp = 900;
            raw.upsert_statuses(&[(1000, cleared)]).unwrap();
        }

        // Self-sync adopts the clear; the now-empty row must be deleted.
        let sync = Synchronizer::new("node1");
        let mut statuses = BTreeMap::from([(1000, ours)]);
        sync.sync_from_self(&mut handle, &mut statuses).unwrap();

        assert!(statuses[&1000].is_empty(&cfg, 1000, &[]));
        let raw = handle.load_raw_statuses().unwrap();
        assert!(raw.get(&1000).is_none_or(|hosts| !hosts.contains_key("node1")));
    }
}
