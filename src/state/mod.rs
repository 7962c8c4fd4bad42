// src/state/mod.rs

//! Durable state store for installed packages
//!
//! One SQLite database file per state directory records which packages are
//! installed into which environments. Every mutation runs in a single
//! transaction: a crash mid-write leaves the previous record intact, never
//! a torn one. Processes sharing a state directory serialize through
//! SQLite's own transaction manager (WAL mode plus a busy timeout).

pub mod models;
pub mod schema;

use crate::error::{Error, Result};
use crate::resolver::ResolvedPackage;
use models::InstalledPackage;
use rusqlite::{Connection, Transaction};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Database filename inside a state directory
pub const STATE_DB_FILENAME: &str = "burrow.db";

/// Handle to the state database for one state directory
pub struct StateStore {
    conn: Connection,
    path: PathBuf,
}

impl StateStore {
    /// Open (creating and migrating if needed) the state database.
    ///
    /// An integrity check failure is surfaced as `StateCorruption`; no
    /// auto-repair is attempted.
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .map_err(|e| Error::InitError(format!("Failed to create state directory: {}", e)))?;
        let path = state_dir.join(STATE_DB_FILENAME);
        debug!("Opening state database at {}", path.display());

        let conn = Connection::open(&path)?;

        // WAL keeps readers unblocked while another process writes;
        // busy_timeout makes cross-process writer contention wait, not fail
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        schema::migrate(&conn)?;

        let store = Self { conn, path };
        store.check()?;
        Ok(store)
    }

    /// Path of the underlying database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run SQLite's integrity check, mapping failure to `StateCorruption`
    pub fn check(&self) -> Result<()> {
        let verdict: String =
            self.conn
                .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            return Err(Error::StateCorruption(format!(
                "integrity check failed for {}: {}",
                self.path.display(),
                verdict
            )));
        }
        Ok(())
    }

    /// Insert or overwrite the record for a resolved package.
    ///
    /// The channel label, when given, marks the record as channel-bound so
    /// later syncs can advance it through the upgrade protocol.
    pub fn record(
        &mut self,
        environment: &str,
        resolved: &ResolvedPackage,
        channel: Option<&str>,
    ) -> Result<InstalledPackage> {
        let record = InstalledPackage::new(
            environment.to_string(),
            resolved.name.clone(),
            resolved.version.to_string(),
            channel.map(|c| c.to_string()),
            resolved.digest.clone(),
            resolved.platform.to_string(),
        );

        self.transaction(|tx| record.upsert(tx))?;
        info!(
            "Recorded {}-{} in environment '{}'",
            record.name, record.version, environment
        );

        // Re-read so the caller sees database-assigned timestamps
        InstalledPackage::find(&self.conn, environment, &record.name)?.ok_or_else(|| {
            Error::StateCorruption(format!(
                "record for {} missing immediately after commit",
                record.name
            ))
        })
    }

    /// Remove a record; returns whether it existed
    pub fn remove(&mut self, environment: &str, name: &str) -> Result<bool> {
        let existed = self.transaction(|tx| InstalledPackage::delete(tx, environment, name))?;
        if existed {
            info!("Removed {} from environment '{}'", name, environment);
        }
        Ok(existed)
    }

    /// Look up a single record
    pub fn get(&self, environment: &str, name: &str) -> Result<Option<InstalledPackage>> {
        InstalledPackage::find(&self.conn, environment, name)
    }

    /// Stable snapshot of every record in an environment
    pub fn list(&self, environment: &str) -> Result<Vec<InstalledPackage>> {
        InstalledPackage::list(&self.conn, environment)
    }

    /// Record that an upgrade check ran now for a package
    pub fn touch_upgrade_check(&mut self, environment: &str, name: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.transaction(|tx| InstalledPackage::touch_upgrade_check(tx, environment, name, &now))
    }

    /// Execute a closure within a transaction.
    ///
    /// Commits on Ok, rolls back on Err or panic (via Drop).
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let tx = self.conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;
    use semver::Version;
    use std::collections::BTreeMap;

    fn resolved(name: &str, version: &str) -> ResolvedPackage {
        ResolvedPackage {
            name: name.to_string(),
            version: Version::parse(version).unwrap(),
            platform: Platform::new("linux", "amd64"),
            digest: "cd".repeat(32),
            url: format!("https://example.com/{}-{}.tar.gz", name, version),
            channel: None,
            env: BTreeMap::new(),
            requires: Vec::new(),
        }
    }

    #[test]
    fn test_open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        assert!(store.path().exists());
        assert_eq!(store.path().file_name().unwrap(), STATE_DB_FILENAME);
    }

    #[test]
    fn test_open_is_idempotent_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = StateStore::open(dir.path()).unwrap();
            store.record("default", &resolved("go", "1.21.3"), None).unwrap();
        }
        let store = StateStore::open(dir.path()).unwrap();
        let record = store.get("default", "go").unwrap().unwrap();
        assert_eq!(record.version, "1.21.3");
    }

    #[test]
    fn test_record_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(dir.path()).unwrap();

        store
            .record("default", &resolved("go", "1.21.3"), Some("stable"))
            .unwrap();
        store.record("default", &resolved("node", "20.0.0"), None).unwrap();

        let records = store.list("default").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "go");
        assert_eq!(records[0].channel.as_deref(), Some("stable"));
        assert_eq!(records[1].name, "node");
        assert_eq!(records[1].channel, None);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(dir.path()).unwrap();
        store.record("default", &resolved("go", "1.21.3"), None).unwrap();

        // A transaction that writes and then errors must leave no trace
        let result: Result<()> = store.transaction(|tx| {
            let replacement = InstalledPackage::new(
                "default".to_string(),
                "go".to_string(),
                "9.9.9".to_string(),
                None,
                "ee".repeat(32),
                "linux-amd64".to_string(),
            );
            replacement.upsert(tx)?;
            Err(Error::StateCorruption("simulated failure".to_string()))
        });
        assert!(result.is_err());

        let record = store.get("default", "go").unwrap().unwrap();
        assert_eq!(record.version, "1.21.3", "rollback must restore the prior record");
    }

    #[test]
    fn test_touch_upgrade_check_sets_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(dir.path()).unwrap();
        store
            .record("default", &resolved("go", "1.21.3"), Some("stable"))
            .unwrap();

        store.touch_upgrade_check("default", "go").unwrap();
        let record = store.get("default", "go").unwrap().unwrap();
        assert!(record.last_upgrade_check.is_some());
    }
}
