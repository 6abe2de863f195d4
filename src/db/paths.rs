// src/db/paths.rs
//! Centralized path derivation for the database directory
//!
//! Everything the engine persists lives under one directory,
//! `{root}/var/lib/conarydb` by default.

use std::path::{Path, PathBuf};

/// The SQLite database file
pub fn db_file(db_dir: &Path) -> PathBuf {
    db_dir.join("conarydb")
}

/// Root of the rollback stack
pub fn rollback_dir(db_dir: &Path) -> PathBuf {
    db_dir.join("rollbacks")
}

/// `first N` / `last M` status file of the rollback stack
pub fn rollback_status(db_dir: &Path) -> PathBuf {
    rollback_dir(db_dir).join("status")
}

/// Directory of rollback number `index`
pub fn rollback_entry(db_dir: &Path, index: u64) -> PathBuf {
    rollback_dir(db_dir).join(index.to_string())
}

/// Journal of the apply in progress
pub fn journal_path(db_dir: &Path) -> PathBuf {
    db_dir.join("journal")
}

/// Exclusive lock serializing writers on one root
pub fn lock_path(db_dir: &Path) -> PathBuf {
    db_dir.join("lock")
}

/// Pristine contents of installed config files, stored by sha1
pub fn config_contents_dir(db_dir: &Path) -> PathBuf {
    db_dir.join("config-contents")
}

/// Marker describing the jobs left after a critical update
pub fn restart_info(db_dir: &Path) -> PathBuf {
    db_dir.join("restart-info")
}

/// Change set holding the jobs left after a critical update
pub fn restart_changeset(db_dir: &Path) -> PathBuf {
    db_dir.join("restart.ccs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let dir = Path::new("/var/lib/conarydb");
        assert_eq!(db_file(dir), PathBuf::from("/var/lib/conarydb/conarydb"));
        assert_eq!(
            rollback_status(dir),
            PathBuf::from("/var/lib/conarydb/rollbacks/status")
        );
        assert_eq!(
            rollback_entry(dir, 3),
            PathBuf::from("/var/lib/conarydb/rollbacks/3")
        );
        assert_eq!(journal_path(dir), PathBuf::from("/var/lib/conarydb/journal"));
    }
}
