//! PostgreSQL-backed status store.
//!
//! Connects lazily and reconnects after transient failures; a lost
//! connection surfaces as `StoreError::Transient` so the caller's retry
//! and next-tick re-read take over. Batches are applied in a single
//! transaction per the upsert contract.

use crate::badness::Badness;
use crate::status::Status;
use crate::store::{MigrationOutcome, StatusStore, StoreError};
use postgres::{Client, NoTls};
use std::collections::BTreeMap;
use tracing::{debug, info};

const CREATE_STATUS_TABLE: &str = "CREATE TABLE IF NOT EXISTS status (\
    uid INTEGER NOT NULL, \
    current_status TEXT NOT NULL, \
    default_status TEXT NOT NULL, \
    occurrences INTEGER NOT NULL, \
    timestamp BIGINT NOT NULL, \
    occurrences_timestamp BIGINT NOT NULL, \
    hostname VARCHAR(64) NOT NULL, \
    sync_group VARCHAR(64), \
    CONSTRAINT same_user_status PRIMARY KEY (uid, hostname))";

const CREATE_BADNESS_TABLE: &str = "CREATE TABLE IF NOT EXISTS badness (\
    uid INTEGER NOT NULL, \
    timestamp BIGINT NOT NULL, \
    cpu_badness DOUBLE PRECISION NOT NULL, \
    mem_badness DOUBLE PRECISION NOT NULL, \
    hostname VARCHAR(64) NOT NULL, \
    sync_group VARCHAR(64), \
    CONSTRAINT same_user_badness PRIMARY KEY (uid, hostname))";

/// The statement that moves a pre-v3 table aside before the v3 table is
/// created in its place.
fn rename_aside_sql(table: &str) -> String {
    format!("ALTER TABLE {table} RENAME TO old_{table}")
}

/// Status store backed by a shared PostgreSQL server.
pub struct PostgresStore {
    connection_string: String,
    hostname: String,
    sync_group: String,
    client: Option<Client>,
    known_hosts: Vec<String>,
}

impl PostgresStore {
    pub fn new(
        connection_string: impl Into<String>,
        hostname: impl Into<String>,
        sync_group: impl Into<String>,
    ) -> Self {
        Self {
            connection_string: connection_string.into(),
            hostname: hostname.into(),
            sync_group: sync_group.into(),
            client: None,
            known_hosts: Vec::new(),
        }
    }

    /// Ensures the connection is established, reconnecting if needed.
    fn ensure_connected(&mut self) -> Result<(), StoreError> {
        if self.client.is_some() {
            return Ok(());
        }
        match Client::connect(&self.connection_string, NoTls) {
            Ok(client) => {
                debug!("status store connected");
                self.client = Some(client);
                Ok(())
            }
            Err(e) => Err(StoreError::Transient(format_postgres_error(&e))),
        }
    }

    /// Runs a query closure against the connection; failures drop the
    /// connection so the next call reconnects.
    fn run<T>(
        &mut self,
        f: impl FnOnce(&mut Client) -> Result<T, postgres::Error>,
    ) -> Result<T, StoreError> {
        self.ensure_connected()?;
        let Some(client) = self.client.as_mut() else {
            return Err(StoreError::Transient("not connected".into()));
        };
        match f(client) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.client = None;
                Err(StoreError::Transient(format_postgres_error(&e)))
            }
        }
    }

    fn table_columns(&mut self, table: &str) -> Result<Vec<String>, StoreError> {
        let table = table.to_string();
        let rows = self.run(|client| {
            client.query(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_name = $1",
                &[&table],
            )
        })?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    /// Renames a pre-v3 table aside and creates the v3 table. In-place
    /// column adds are avoided so the migration stays idempotent across
    /// engines.
    fn migrate_table(&mut self, table: &str, create_sql: &str) -> Result<bool, StoreError> {
        let columns = self.table_columns(table)?;
        let mut migrated = false;
        if !columns.is_empty() && !columns.iter().any(|c| c == "sync_group") {
            info!(table = table, "pre-v3 table found; renaming aside");
            let rename = rename_aside_sql(table);
            self.run(|client| client.batch_execute(&rename))
                .map_err(schema_error)?;
            migrated = true;
        }
        self.run(|client| client.batch_execute(create_sql))
            .map_err(schema_error)?;
        Ok(migrated)
    }
}

/// DDL failures are schema errors, not retryable transients.
fn schema_error(err: StoreError) -> StoreError {
    match err {
        StoreError::Transient(msg) => StoreError::Schema(msg),
        other => other,
    }
}

impl StatusStore for PostgresStore {
    fn ensure_tables(&mut self) -> Result<MigrationOutcome, StoreError> {
        let status_existed = !self.table_columns("status")?.is_empty();
        let badness_existed = !self.table_columns("badness")?.is_empty();

        let status_migrated = self.migrate_table("status", CREATE_STATUS_TABLE)?;
        let badness_migrated = self.migrate_table("badness", CREATE_BADNESS_TABLE)?;

        // Side-cleanup: our host's rows with a stale sync group.
        let hostname = self.hostname.clone();
        let sync_group = self.sync_group.clone();
        self.run(|client| {
            client.execute(
                "DELETE FROM status WHERE hostname = $1 AND sync_group IS DISTINCT FROM $2",
                &[&hostname, &sync_group],
            )?;
            client.execute(
                "DELETE FROM badness WHERE hostname = $1 AND sync_group IS DISTINCT FROM $2",
                &[&hostname, &sync_group],
            )
        })?;

        Ok(MigrationOutcome {
            created: !status_existed || !badness_existed,
            migrated: status_migrated || badness_migrated,
        })
    }

    fn load_statuses(&mut self) -> Result<BTreeMap<u32, BTreeMap<String, Status>>, StoreError> {
        let sync_group = self.sync_group.clone();
        let rows = self.run(|client| {
            client.query(
                "SELECT uid, current_status, default_status, occurrences, \
                        timestamp, occurrences_timestamp, hostname \
                 FROM status WHERE sync_group = $1",
                &[&sync_group],
            )
        })?;

        let mut result: BTreeMap<u32, BTreeMap<String, Status>> = BTreeMap::new();
        let mut hosts = Vec::new();
        for row in rows {
            let uid: i32 = row.get(0);
            let hostname: String = row.get(6);
            let status = Status {
                current: row.get(1),
                default: row.get(2),
                occurrences: row.get::<_, i32>(3).max(0) as u32,
                timestamp: row.get(4),
                occur_timestamp: row.get(5),
                authority: hostname.clone(),
            };
            result
                .entry(uid.max(0) as u32)
                .or_default()
                .insert(hostname.clone(), status);
            if !hosts.contains(&hostname) {
                hosts.push(hostname);
            }
        }
        self.known_hosts = hosts;
        Ok(result)
    }

    fn load_badness(&mut self) -> Result<BTreeMap<u32, Badness>, StoreError> {
        let hostname = self.hostname.clone();
        let sync_group = self.sync_group.clone();
        let rows = self.run(|client| {
            client.query(
                "SELECT uid, timestamp, cpu_badness, mem_badness \
                 FROM badness WHERE hostname = $1 AND sync_group = $2",
                &[&hostname, &sync_group],
            )
        })?;

        Ok(rows
            .iter()
            .map(|row| {
                let uid: i32 = row.get(0);
                let badness =
                    Badness::imported(row.get::<_, f64>(2), row.get::<_, f64>(3), row.get(1));
                (uid.max(0) as u32, badness)
            })
            .collect())
    }

    fn upsert_statuses(&mut self, rows: &[(u32, Status)]) -> Result<(), StoreError> {
        let hostname = self.hostname.clone();
        let sync_group = self.sync_group.clone();
        self.run(|client| {
            let mut transaction = client.transaction()?;
            for (uid, status) in rows {
                transaction.execute(
                    "INSERT INTO status (uid, current_status, default_status, occurrences, \
                            timestamp, occurrences_timestamp, hostname, sync_group) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                     ON CONFLICT (uid, hostname) DO UPDATE SET \
                            current_status = EXCLUDED.current_status, \
                            default_status = EXCLUDED.default_status, \
                            occurrences = EXCLUDED.occurrences, \
                            timestamp = EXCLUDED.timestamp, \
                            occurrences_timestamp = EXCLUDED.occurrences_timestamp, \
                            sync_group = EXCLUDED.sync_group",
                    &[
                        &(*uid as i32),
                        &status.current,
                        &status.default,
                        &(status.occurrences as i32),
                        &status.timestamp,
                        &status.occur_timestamp,
                        &hostname,
                        &sync_group,
                    ],
                )?;
            }
            transaction.commit()
        })
    }

    fn upsert_badness(&mut self, rows: &[(u32, Badness)]) -> Result<(), StoreError> {
        let hostname = self.hostname.clone();
        let sync_group = self.sync_group.clone();
        self.run(|client| {
            let mut transaction = client.transaction()?;
            for (uid, badness) in rows {
                transaction.execute(
                    "INSERT INTO badness (uid, timestamp, cpu_badness, mem_badness, \
                            hostname, sync_group) \
                     VALUES ($1, $2, $3, $4, $5, $6) \
                     ON CONFLICT (uid, hostname) DO UPDATE SET \
                            timestamp = EXCLUDED.timestamp, \
                            cpu_badness = EXCLUDED.cpu_badness, \
                            mem_badness = EXCLUDED.mem_badness, \
                            sync_group = EXCLUDED.sync_group",
                    &[
                        &(*uid as i32),
                        &badness.updated_ts,
                        &badness.cpu,
                        &badness.mem,
                        &hostname,
                        &sync_group,
                    ],
                )?;
            }
            transaction.commit()
        })
    }

    fn delete_status(&mut self, uid: u32) -> Result<(), StoreError> {
        let hostname = self.hostname.clone();
        let sync_group = self.sync_group.clone();
        self.run(|client| {
            client.execute(
                "DELETE FROM status WHERE uid = $1 AND hostname = $2 AND sync_group = $3",
                &[&(uid as i32), &hostname, &sync_group],
            )
        })?;
        Ok(())
    }

    fn delete_badness(&mut self, uid: u32) -> Result<(), StoreError> {
        let hostname = self.hostname.clone();
        let sync_group = self.sync_group.clone();
        self.run(|client| {
            client.execute(
                "DELETE FROM badness WHERE uid = $1 AND hostname = $2 AND sync_group = $3",
                &[&(uid as i32), &hostname, &sync_group],
            )
        })?;
        Ok(())
    }

    fn known_syncing_hosts(&self) -> Vec<String> {
        self.known_hosts.clone()
    }
}

/// Formats a PostgreSQL error for logs.
fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else {
            msg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_promotes_transients_only() {
        let promoted = schema_error(StoreError::Transient("bad DDL".into()));
        assert!(matches!(promoted, StoreError::Schema(msg) if msg == "bad DDL"));

        let passthrough = schema_error(StoreError::Schema("already schema".into()));
        assert!(matches!(passthrough, StoreError::Schema(msg) if msg == "already schema"));
    }

    #[test]
    fn rename_aside_uses_old_prefix() {
        assert_eq!(rename_aside_sql("status"), "ALTER TABLE status RENAME TO old_status");
        assert_eq!(
            rename_aside_sql("badness"),
            "ALTER TABLE badness RENAME TO old_badness"
        );
    }

    #[test]
    fn v3_tables_carry_the_sync_group_column() {
        for sql in [CREATE_STATUS_TABLE, CREATE_BADNESS_TABLE] {
            assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS"));
            assert!(sql.contains("sync_group VARCHAR(64)"));
            assert!(sql.contains("hostname VARCHAR(64) NOT NULL"));
            assert!(sql.contains("PRIMARY KEY (uid, hostname)"));
        }
        // Scores are stored with full precision; timestamps outlive 2038.
        assert!(CREATE_BADNESS_TABLE.contains("cpu_badness DOUBLE PRECISION"));
        assert!(CREATE_STATUS_TABLE.contains("timestamp BIGINT"));
    }
}
