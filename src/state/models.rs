// src/state/models.rs

//! Data model for installed-package records
//!
//! One `InstalledPackage` row exists per (environment, package name). The
//! record is created on install, mutated only on upgrade, and removed on
//! uninstall; the state store is its sole writer.

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};

/// A package installed into an environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub environment: String,
    pub name: String,
    pub version: String,
    /// Channel label this installation tracks, if channel-bound
    pub channel: Option<String>,
    /// sha256 digest of the installed artifact; the cache key
    pub digest: String,
    pub platform: String,
    pub installed_at: Option<String>,
    pub last_upgrade_check: Option<String>,
}

impl InstalledPackage {
    pub fn new(
        environment: String,
        name: String,
        version: String,
        channel: Option<String>,
        digest: String,
        platform: String,
    ) -> Self {
        Self {
            environment,
            name,
            version,
            channel,
            digest,
            platform,
            installed_at: None,
            last_upgrade_check: None,
        }
    }

    /// The reference this record tracks, e.g. `go@stable` or `go@1.21.3`
    pub fn reference(&self) -> String {
        match &self.channel {
            Some(channel) => format!("{}@{}", self.name, channel),
            None => format!("{}@{}", self.name, self.version),
        }
    }

    /// Insert or overwrite this record.
    ///
    /// An existing record keeps its installed_at timestamp; version,
    /// channel, digest, and platform are replaced. A record carrying no
    /// last_upgrade_check keeps the stored timestamp, so an upgrade does
    /// not erase the check that triggered it.
    pub fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO installed_packages
                 (environment, name, version, channel, digest, platform, last_upgrade_check)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(environment, name) DO UPDATE SET
                 version = excluded.version,
                 channel = excluded.channel,
                 digest = excluded.digest,
                 platform = excluded.platform,
                 last_upgrade_check =
                     COALESCE(excluded.last_upgrade_check, last_upgrade_check)",
            params![
                &self.environment,
                &self.name,
                &self.version,
                &self.channel,
                &self.digest,
                &self.platform,
                &self.last_upgrade_check,
            ],
        )?;
        Ok(())
    }

    /// Find a record by environment and package name
    pub fn find(conn: &Connection, environment: &str, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT environment, name, version, channel, digest, platform,
                    installed_at, last_upgrade_check
             FROM installed_packages WHERE environment = ?1 AND name = ?2",
        )?;

        let record = stmt
            .query_row([environment, name], Self::from_row)
            .optional()?;

        Ok(record)
    }

    /// List every record in an environment, in stable name order
    pub fn list(conn: &Connection, environment: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT environment, name, version, channel, digest, platform,
                    installed_at, last_upgrade_check
             FROM installed_packages WHERE environment = ?1 ORDER BY name",
        )?;

        let records = stmt
            .query_map([environment], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Delete a record; returns whether it existed
    pub fn delete(conn: &Connection, environment: &str, name: &str) -> Result<bool> {
        let affected = conn.execute(
            "DELETE FROM installed_packages WHERE environment = ?1 AND name = ?2",
            [environment, name],
        )?;
        Ok(affected > 0)
    }

    /// Record that an upgrade check ran now
    pub fn touch_upgrade_check(
        conn: &Connection,
        environment: &str,
        name: &str,
        at: &str,
    ) -> Result<()> {
        conn.execute(
            "UPDATE installed_packages SET last_upgrade_check = ?3
             WHERE environment = ?1 AND name = ?2",
            [environment, name, at],
        )?;
        Ok(())
    }

    /// Convert a database row to an InstalledPackage
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            environment: row.get(0)?,
            name: row.get(1)?,
            version: row.get(2)?,
            channel: row.get(3)?,
            digest: row.get(4)?,
            platform: row.get(5)?,
            installed_at: row.get(6)?,
            last_upgrade_check: row.get(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::schema;

    fn create_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::migrate(&conn).unwrap();
        conn
    }

    fn record(name: &str, version: &str, channel: Option<&str>) -> InstalledPackage {
        InstalledPackage::new(
            "default".to_string(),
            name.to_string(),
            version.to_string(),
            channel.map(|c| c.to_string()),
            "ab".repeat(32),
            "linux-amd64".to_string(),
        )
    }

    #[test]
    fn test_upsert_and_find() {
        let conn = create_test_db();
        record("go", "1.21.3", Some("stable")).upsert(&conn).unwrap();

        let found = InstalledPackage::find(&conn, "default", "go")
            .unwrap()
            .unwrap();
        assert_eq!(found.version, "1.21.3");
        assert_eq!(found.channel.as_deref(), Some("stable"));
        assert!(found.installed_at.is_some());
        assert_eq!(found.reference(), "go@stable");
    }

    #[test]
    fn test_upsert_overwrites_but_keeps_installed_at() {
        let conn = create_test_db();
        record("go", "1.21.3", Some("stable")).upsert(&conn).unwrap();
        let before = InstalledPackage::find(&conn, "default", "go")
            .unwrap()
            .unwrap();

        record("go", "1.22.0", Some("stable")).upsert(&conn).unwrap();
        let after = InstalledPackage::find(&conn, "default", "go")
            .unwrap()
            .unwrap();

        assert_eq!(after.version, "1.22.0");
        assert_eq!(after.installed_at, before.installed_at);
    }

    #[test]
    fn test_upsert_without_check_timestamp_keeps_stored_one() {
        let conn = create_test_db();
        record("go", "1.21.3", Some("stable")).upsert(&conn).unwrap();
        InstalledPackage::touch_upgrade_check(
            &conn,
            "default",
            "go",
            "2026-08-23T00:00:00+00:00",
        )
        .unwrap();

        // An upgrade upserts a fresh record that carries no timestamp
        record("go", "1.22.0", Some("stable")).upsert(&conn).unwrap();

        let found = InstalledPackage::find(&conn, "default", "go")
            .unwrap()
            .unwrap();
        assert_eq!(found.version, "1.22.0");
        assert_eq!(
            found.last_upgrade_check.as_deref(),
            Some("2026-08-23T00:00:00+00:00")
        );
    }

    #[test]
    fn test_records_are_scoped_per_environment() {
        let conn = create_test_db();
        record("go", "1.21.3", None).upsert(&conn).unwrap();

        let mut other = record("go", "1.20.0", None);
        other.environment = "project-b".to_string();
        other.upsert(&conn).unwrap();

        let default = InstalledPackage::find(&conn, "default", "go")
            .unwrap()
            .unwrap();
        let project_b = InstalledPackage::find(&conn, "project-b", "go")
            .unwrap()
            .unwrap();
        assert_eq!(default.version, "1.21.3");
        assert_eq!(project_b.version, "1.20.0");
    }

    #[test]
    fn test_list_is_name_ordered() {
        let conn = create_test_db();
        record("node", "20.0.0", None).upsert(&conn).unwrap();
        record("go", "1.21.3", None).upsert(&conn).unwrap();
        record("zig", "0.11.0", None).upsert(&conn).unwrap();

        let names: Vec<_> = InstalledPackage::list(&conn, "default")
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["go", "node", "zig"]);
    }

    #[test]
    fn test_delete_reports_existence() {
        let conn = create_test_db();
        record("go", "1.21.3", None).upsert(&conn).unwrap();

        assert!(InstalledPackage::delete(&conn, "default", "go").unwrap());
        assert!(!InstalledPackage::delete(&conn, "default", "go").unwrap());
        assert!(InstalledPackage::find(&conn, "default", "go")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_touch_upgrade_check() {
        let conn = create_test_db();
        record("go", "1.21.3", Some("stable")).upsert(&conn).unwrap();

        InstalledPackage::touch_upgrade_check(
            &conn,
            "default",
            "go",
            "2026-08-23T00:00:00+00:00",
        )
        .unwrap();

        let found = InstalledPackage::find(&conn, "default", "go")
            .unwrap()
            .unwrap();
        assert_eq!(
            found.last_upgrade_check.as_deref(),
            Some("2026-08-23T00:00:00+00:00")
        );
    }
}
