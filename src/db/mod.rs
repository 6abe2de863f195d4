// src/db/mod.rs

//! Local installed-system database
//!
//! The database is a SQLite file holding every installed trove, the files
//! each one owns, dependency data and troveinfo. [`TroveStore`] provides the
//! trove-level operations on top of the row models in [`models`].

pub mod config_cache;
pub mod migrations;
pub mod models;
pub mod paths;
pub mod schema;
pub mod store;

pub use config_cache::ConfigCache;
pub use store::{PathOwner, TroveStore};

use crate::error::{Error, Result};
use rusqlite::{Connection, OpenFlags, Transaction};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

/// Create (if needed) and migrate the database at `db_path`
pub fn init(db_path: &Path) -> Result<Connection> {
    info!("Initializing database at: {}", db_path.display());

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::InitError(format!(
                "Failed to create database directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let conn = Connection::open(db_path)?;
    configure(&conn)?;
    schema::migrate(&conn)?;
    debug!("Database ready");
    Ok(conn)
}

/// Open an existing database, migrating it forward if needed
pub fn open(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        return Err(Error::DatabaseNotFound(db_path.display().to_string()));
    }
    let conn = Connection::open(db_path)?;
    configure(&conn)?;
    schema::migrate(&conn)?;
    Ok(conn)
}

/// Open an existing database without writing to it
///
/// Fails with `OldSchema` or `NewSchema` if the schema does not match.
pub fn open_readonly(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        return Err(Error::DatabaseNotFound(db_path.display().to_string()));
    }
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
    schema::check_schema(&conn)?;
    Ok(conn)
}

/// Run `f` inside a write transaction; commits on `Ok`, rolls back on `Err`
pub fn transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Run `f` inside a named savepoint on a shared connection
///
/// Nests inside an open transaction. On `Err` everything `f` wrote is
/// rolled back before the error is returned.
pub fn savepoint<T, F>(conn: &Connection, name: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    conn.execute_batch(&format!("SAVEPOINT {name}"))?;
    match f() {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {name}"))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(undo) = conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}")) {
                warn!("could not roll back savepoint {}: {}", name, undo);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("var/lib/conarydb/conarydb");
        let conn = init(&path).unwrap();
        assert!(path.exists());
        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_open_missing() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            open(&dir.path().join("nope")),
            Err(Error::DatabaseNotFound(_))
        ));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conarydb");
        let mut conn = init(&path).unwrap();

        let result: Result<()> = transaction(&mut conn, |tx| {
            tx.execute("INSERT INTO Items (item) VALUES ('foo')", [])?;
            Err(Error::NotFound("forced".to_string()))
        });
        assert!(result.is_err());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM Items", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);

        transaction(&mut conn, |tx| {
            tx.execute("INSERT INTO Items (item) VALUES ('foo')", [])?;
            Ok(())
        })
        .unwrap();
        drop(conn);
        let ro = open_readonly(&path).unwrap();
        let count: i64 = ro
            .query_row("SELECT COUNT(*) FROM Items", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_savepoint_undoes_partial_writes() {
        let dir = TempDir::new().unwrap();
        let mut conn = init(&dir.path().join("conarydb")).unwrap();

        transaction(&mut conn, |tx| {
            tx.execute("INSERT INTO Items (item) VALUES ('kept')", [])?;
            let result: Result<()> = savepoint(tx, "inner", || {
                tx.execute("INSERT INTO Items (item) VALUES ('dropped')", [])?;
                Err(Error::NotFound("forced".to_string()))
            });
            assert!(result.is_err());
            savepoint(tx, "inner", || {
                tx.execute("INSERT INTO Items (item) VALUES ('second')", [])?;
                Ok(())
            })
        })
        .unwrap();

        let items: Vec<String> = conn
            .prepare("SELECT item FROM Items ORDER BY item")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(items, vec!["kept".to_string(), "second".to_string()]);
    }
}
