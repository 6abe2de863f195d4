// src/db/schema.rs

//! Schema version tracking and migration driver
//!
//! Migrations are numbered and applied in order; each one lives in
//! [`super::migrations`]. A database written by a newer engine is refused.

use super::migrations;
use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Flag value of the base row every dependency carries in Provides/Requires
pub const NO_FLAG_MAGIC: &str = "-*none*-";

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Fail unless the database is exactly at [`SCHEMA_VERSION`]
pub fn check_schema(conn: &Connection) -> Result<()> {
    let found = get_schema_version(conn)?;
    match found.cmp(&SCHEMA_VERSION) {
        std::cmp::Ordering::Less => Err(Error::OldSchema {
            found,
            expected: SCHEMA_VERSION,
        }),
        std::cmp::Ordering::Greater => Err(Error::NewSchema {
            found,
            expected: SCHEMA_VERSION,
        }),
        std::cmp::Ordering::Equal => Ok(()),
    }
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version > SCHEMA_VERSION {
        return Err(Error::NewSchema {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }
    if current_version == SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!(
        "Schema migration complete. Now at version {}",
        SCHEMA_VERSION
    );
    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrations::migrate_v1(conn),
        2 => migrations::migrate_v2(conn),
        other => Err(Error::InitError(format!(
            "no migration to schema version {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_schema_version_tracking() {
        let (_temp, conn) = create_test_db();
        assert_eq!(get_schema_version(&conn).unwrap(), 0);
        assert!(matches!(check_schema(&conn), Err(Error::OldSchema { found: 0, .. })));

        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        check_schema(&conn).unwrap();
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "Items",
            "Versions",
            "Branches",
            "Labels",
            "LabelMap",
            "Flavors",
            "FlavorMap",
            "Instances",
            "TroveTroves",
            "FileStreams",
            "TroveFiles",
            "Dependencies",
            "Provides",
            "Requires",
            "TroveInfo",
            "CheckTroveCache",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();
        set_schema_version(&conn, SCHEMA_VERSION + 1).unwrap();
        assert!(matches!(migrate(&conn), Err(Error::NewSchema { .. })));
        assert!(matches!(check_schema(&conn), Err(Error::NewSchema { .. })));
    }

    #[test]
    fn test_instance_identity_is_unique() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();
        conn.execute("INSERT INTO Items (item) VALUES ('foo')", []).unwrap();
        conn.execute("INSERT INTO Versions (version) VALUES ('/a@b:c/1-1')", []).unwrap();
        let insert = "INSERT INTO Instances (itemId, versionId, flavorId, timeStamps)
                      VALUES (1, 1, 0, '0')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
