// src/transaction/mod.rs

//! Crash safety for applies
//!
//! - **Root lock**: one writer per root, serialized through an exclusive
//!   lock file in the database directory
//! - **Operation journal**: every filesystem mutation is recorded before it
//!   happens so a failed or interrupted apply can be reverted
//! - **Recovery**: a journal found on the next run is finished or reverted
//! - **Cancellation**: SIGTERM/SIGINT during an apply become a clean revert
//!
//! ```text
//! lock -> recover -> journal.start -> mutate... -> db commit -> journal.commit
//!                                         \-> error/signal -> journal.revert
//! ```

mod journal;
mod recovery;

pub use journal::{
    EntryKind, JOURNAL_VERSION, JobJournal, JournalEntry, SavedInode, is_saved_copy, read_entries,
};
pub use recovery::{RecoveryOutcome, recover};

use crate::db::paths;
use crate::error::{Error, Result};
use fs2::FileExt;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Move a file, falling back to copy+sync+delete across filesystems
pub(crate) fn move_file_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            log::debug!(
                "Cross-filesystem move ({} -> {}), using copy fallback",
                src.display(),
                dst.display()
            );
            fs::copy(src, dst)?;
            File::open(dst)?.sync_all()?;
            if let Some(parent) = dst.parent()
                && let Ok(dir) = File::open(parent)
            {
                // not all filesystems support fsync on directories
                let _ = dir.sync_all();
            }
            fs::remove_file(src)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Exclusive lock on a root, released on drop
#[derive(Debug)]
pub struct RootLock {
    file: File,
    path: PathBuf,
}

impl RootLock {
    /// Take the lock in `db_dir`, retrying with backoff until `timeout`
    pub fn acquire(db_dir: &Path, timeout: Duration) -> Result<Self> {
        fs::create_dir_all(db_dir)?;
        let path = paths::lock_path(db_dir);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let deadline = Instant::now() + timeout;
        let mut attempt: u32 = 0;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        log::warn!("Lock {} still held: {}", path.display(), e);
                        return Err(Error::Locked(path.display().to_string()));
                    }
                    let delay = Duration::from_millis(100 * (1 << attempt.min(4)));
                    std::thread::sleep(delay.min(deadline - now));
                    attempt += 1;
                }
            }
        }

        log::debug!("Acquired root lock {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// Set from the signal handler; read by every [`CancelToken`]
static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_termination(_: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Cooperative cancellation flag polled between mutations
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || SIGNALLED.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// SIGTERM/SIGINT handlers installed for the length of an apply
///
/// While the guard lives the signals only raise the cancellation flag;
/// dropping it restores the previous dispositions.
pub struct SignalGuard {
    previous: Vec<(Signal, SigAction)>,
}

impl SignalGuard {
    pub fn install() -> Result<Self> {
        SIGNALLED.store(false, Ordering::SeqCst);
        let action = SigAction::new(
            SigHandler::Handler(on_termination),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let mut previous = Vec::new();
        for sig in [Signal::SIGTERM, Signal::SIGINT] {
            // SAFETY: the handler only stores to an atomic
            let old = unsafe { signal::sigaction(sig, &action) }
                .map_err(|e| Error::IoError(format!("sigaction {}: {}", sig, e)))?;
            previous.push((sig, old));
        }
        Ok(Self { previous })
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for (sig, old) in self.previous.drain(..) {
            // SAFETY: restoring the disposition that was in place before
            if let Err(e) = unsafe { signal::sigaction(sig, &old) } {
                log::warn!("Failed to restore handler for {}: {}", sig, e);
            }
        }
        SIGNALLED.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let lock = RootLock::acquire(dir.path(), Duration::from_millis(50)).unwrap();
        assert!(lock.path().ends_with("lock"));

        let second = RootLock::acquire(dir.path(), Duration::from_millis(150));
        assert!(matches!(second, Err(Error::Locked(_))));

        drop(lock);
        RootLock::acquire(dir.path(), Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        let clone = token.clone();
        clone.cancel();
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_move_file_atomic() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        fs::write(&src, b"data").unwrap();
        move_file_atomic(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"data");
    }
}
