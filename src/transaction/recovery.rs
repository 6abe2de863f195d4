// src/transaction/recovery.rs

//! Recovery of an apply that was interrupted
//!
//! A journal left in the database directory means the previous apply never
//! reached its end. If the journal carries the COMMITTED marker the database
//! already reflects the new state and only deferred cleanups remain (roll
//! forward). Otherwise every recorded mutation is undone (roll back).

use crate::db::paths;
use crate::error::Result;
use std::path::Path;

use super::journal::JobJournal;

/// Outcome of recovering a root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No journal was present
    Clean,
    /// The apply had committed; pending cleanups were finished
    RolledForward { entries: usize },
    /// The apply was reverted
    RolledBack { entries: usize, failures: usize },
    /// The journal could not be read and was moved aside
    Corrupted { error: String },
}

/// Recover the root whose database lives in `db_dir`
pub fn recover(root: &Path, db_dir: &Path) -> Result<RecoveryOutcome> {
    let journal_path = paths::journal_path(db_dir);
    if !journal_path.exists() {
        return Ok(RecoveryOutcome::Clean);
    }

    let journal = match JobJournal::load(root, &journal_path) {
        Ok(journal) => journal,
        Err(e) => {
            // keep the evidence but stop it from blocking the next apply
            let aside = journal_path.with_extension("corrupt");
            log::error!(
                "Journal {} is unreadable ({}); moved to {}",
                journal_path.display(),
                e,
                aside.display()
            );
            std::fs::rename(&journal_path, &aside)?;
            return Ok(RecoveryOutcome::Corrupted {
                error: e.to_string(),
            });
        }
    };

    let entries = journal.entries().len();
    if journal.is_committed() {
        log::info!("Finishing committed journal {}", journal_path.display());
        journal.commit()?;
        Ok(RecoveryOutcome::RolledForward { entries })
    } else {
        log::warn!(
            "Reverting interrupted journal {} ({} entries)",
            journal_path.display(),
            entries
        );
        let failures = journal.revert()?;
        Ok(RecoveryOutcome::RolledBack { entries, failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, std::path::PathBuf, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let db_dir = root.join("var/lib/conarydb");
        fs::create_dir_all(&db_dir).unwrap();
        (dir, root, db_dir)
    }

    #[test]
    fn test_clean_root() {
        let (_dir, root, db_dir) = setup();
        assert_eq!(recover(&root, &db_dir).unwrap(), RecoveryOutcome::Clean);
    }

    #[test]
    fn test_rolls_back_uncommitted() {
        let (_dir, root, db_dir) = setup();
        let target = root.join("file");
        fs::write(&target, b"old").unwrap();

        let mut journal = JobJournal::start(&root, &paths::journal_path(&db_dir)).unwrap();
        journal.backup(&target).unwrap();
        // a fresh inode, as an apply writes it
        fs::write(root.join("file.new"), b"new").unwrap();
        fs::rename(root.join("file.new"), &target).unwrap();
        journal.create(&root.join("added")).unwrap();
        fs::write(root.join("added"), b"x").unwrap();
        drop(journal);

        let outcome = recover(&root, &db_dir).unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::RolledBack {
                entries: 2,
                failures: 0
            }
        );
        assert_eq!(fs::read(&target).unwrap(), b"old");
        assert!(!root.join("added").exists());
        assert!(!paths::journal_path(&db_dir).exists());
    }

    #[test]
    fn test_corrupt_journal_moved_aside() {
        let (_dir, root, db_dir) = setup();
        fs::write(paths::journal_path(&db_dir), [0xff, 0xff, 0x01]).unwrap();
        let outcome = recover(&root, &db_dir).unwrap();
        assert!(matches!(outcome, RecoveryOutcome::Corrupted { .. }));
        assert!(!paths::journal_path(&db_dir).exists());
    }
}
