// src/transaction/journal.rs

//! Back-to-front operation journal
//!
//! Every filesystem mutation an apply performs is recorded here *before* it
//! happens. If the apply fails, or the process dies and recovery finds the
//! file on the next run, the records are replayed newest first to put the
//! filesystem back the way it was.
//!
//! File layout:
//!
//! ```text
//! u16 version (0x0001)
//! body | kind:u8 | len:u16       (repeated; integers big-endian)
//! ```
//!
//! The trailer follows its body, so a reader starts at the end of the file
//! and walks backwards. Bodies use the typed-field encoding: old path (1),
//! new path (2) and, for entries that save metadata, an inode block (3) of
//! perms:u16, mtime:u32, uid:u32, gid:u32. Paths are stored relative to the
//! install root so a journal can be replayed from any mount point.

use crate::error::{Error, Result};
use crate::streams::{FieldReader, FieldWriter};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Journal format version written at offset 0
pub const JOURNAL_VERSION: u16 = 0x0001;

const TRAILER_LEN: u64 = 3;

/// Kind of a journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Rename,
    Backup,
    Create,
    Remove,
    Mkdir,
    BackDir,
    TryCleanupDir,
    /// The apply finished; recovery rolls forward instead of back
    Committed,
}

impl EntryKind {
    pub fn as_u8(self) -> u8 {
        match self {
            EntryKind::Rename => 0,
            EntryKind::Backup => 1,
            EntryKind::Create => 2,
            EntryKind::Remove => 3,
            EntryKind::Mkdir => 4,
            EntryKind::BackDir => 5,
            EntryKind::TryCleanupDir => 6,
            EntryKind::Committed => 7,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => EntryKind::Rename,
            1 => EntryKind::Backup,
            2 => EntryKind::Create,
            3 => EntryKind::Remove,
            4 => EntryKind::Mkdir,
            5 => EntryKind::BackDir,
            6 => EntryKind::TryCleanupDir,
            7 => EntryKind::Committed,
            other => {
                return Err(Error::ParseError(format!(
                    "unknown journal entry kind {}",
                    other
                )));
            }
        })
    }
}

/// Inode metadata saved so a revert can restore it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedInode {
    pub perms: u16,
    pub mtime: u32,
    pub uid: u32,
    pub gid: u32,
}

impl SavedInode {
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        Self {
            perms: (meta.mode() & 0o7777) as u16,
            mtime: meta.mtime().max(0) as u32,
            uid: meta.uid(),
            gid: meta.gid(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14);
        out.extend_from_slice(&self.perms.to_be_bytes());
        out.extend_from_slice(&self.mtime.to_be_bytes());
        out.extend_from_slice(&self.uid.to_be_bytes());
        out.extend_from_slice(&self.gid.to_be_bytes());
        out
    }

    fn decode(body: &[u8]) -> Result<Self> {
        if body.len() != 14 {
            return Err(Error::ParseError(format!(
                "journal inode block has {} bytes",
                body.len()
            )));
        }
        let u32_at = |i: usize| u32::from_be_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]);
        Ok(Self {
            perms: u16::from_be_bytes([body[0], body[1]]),
            mtime: u32_at(2),
            uid: u32_at(6),
            gid: u32_at(10),
        })
    }

    /// Put the saved metadata back on `path`
    fn restore(&self, path: &Path, is_symlink: bool) -> Result<()> {
        // ownership changes need privileges; unprivileged reverts keep
        // whatever owner the file already has
        if nix::unistd::geteuid().is_root() {
            std::os::unix::fs::lchown(path, Some(self.uid), Some(self.gid))?;
        }
        if !is_symlink {
            fs::set_permissions(path, fs::Permissions::from_mode(self.perms as u32))?;
            let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(self.mtime as u64);
            File::open(path)?.set_modified(mtime)?;
        }
        Ok(())
    }
}

/// One decoded journal record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub kind: EntryKind,
    /// Root-relative path the entry is about
    pub old: String,
    /// Second path: rename destination or backup copy
    pub new: Option<String>,
    pub inode: Option<SavedInode>,
}

impl JournalEntry {
    fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        w.str(1, &self.old);
        if let Some(new) = &self.new {
            w.str(2, new);
        }
        if let Some(inode) = &self.inode {
            w.bytes(3, &inode.encode());
        }
        w.finish()
    }

    fn decode(kind: EntryKind, body: &[u8]) -> Result<Self> {
        let r = FieldReader::parse(body)?;
        Ok(Self {
            kind,
            old: r.string(1)?.unwrap_or_default(),
            new: r.string(2)?,
            inode: r.get(3).map(SavedInode::decode).transpose()?,
        })
    }
}

/// Journal of one apply
#[derive(Debug)]
pub struct JobJournal {
    root: PathBuf,
    path: PathBuf,
    file: File,
    /// Entries written so far, oldest first
    entries: Vec<JournalEntry>,
}

impl JobJournal {
    /// Start a fresh journal; fails if one already exists
    pub fn start(root: &Path, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::IoError(format!("cannot create journal {}: {}", path.display(), e)))?;
        file.write_all(&JOURNAL_VERSION.to_be_bytes())?;
        file.sync_all()?;
        log::debug!("Started journal {}", path.display());
        Ok(Self {
            root: root.to_path_buf(),
            path: path.to_path_buf(),
            file,
            entries: Vec::new(),
        })
    }

    /// Open an existing journal left by an interrupted apply
    pub fn load(root: &Path, path: &Path) -> Result<Self> {
        let mut entries = read_entries(path)?;
        entries.reverse();
        let file = OpenOptions::new().read(true).append(true).open(path)?;
        Ok(Self {
            root: root.to_path_buf(),
            path: path.to_path_buf(),
            file,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries oldest first
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn is_committed(&self) -> bool {
        self.entries
            .last()
            .is_some_and(|e| e.kind == EntryKind::Committed)
    }

    fn relative(&self, path: &Path) -> Result<String> {
        let rel = path
            .strip_prefix(&self.root)
            .map_err(|_| Error::InvalidPath(format!("{} is outside {}", path.display(), self.root.display())))?;
        Ok(format!("/{}", rel.to_string_lossy()))
    }

    fn absolute(&self, rel: &str) -> PathBuf {
        self.root.join(rel.trim_start_matches('/'))
    }

    fn record(&mut self, entry: JournalEntry) -> Result<()> {
        let body = entry.encode();
        let len = u16::try_from(body.len())
            .map_err(|_| Error::InvalidPath(format!("journal entry for {} is too long", entry.old)))?;
        let mut buf = body;
        buf.push(entry.kind.as_u8());
        buf.extend_from_slice(&len.to_be_bytes());
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        self.entries.push(entry);
        Ok(())
    }

    /// Rename `old` to `new`
    pub fn rename(&mut self, old: &Path, new: &Path) -> Result<()> {
        let entry = JournalEntry {
            kind: EntryKind::Rename,
            old: self.relative(old)?,
            new: Some(self.relative(new)?),
            inode: None,
        };
        self.record(entry)?;
        fs::rename(old, new)?;
        Ok(())
    }

    /// Note that `new` is about to be created; a revert removes it
    pub fn create(&mut self, new: &Path) -> Result<()> {
        let entry = JournalEntry {
            kind: EntryKind::Create,
            old: self.relative(new)?,
            new: None,
            inode: None,
        };
        self.record(entry)
    }

    /// Create one directory
    pub fn mkdir(&mut self, new: &Path, perms: u32) -> Result<()> {
        let entry = JournalEntry {
            kind: EntryKind::Mkdir,
            old: self.relative(new)?,
            new: None,
            inode: None,
        };
        self.record(entry)?;
        fs::create_dir(new)?;
        fs::set_permissions(new, fs::Permissions::from_mode(perms))?;
        Ok(())
    }

    /// Create `dir` and any missing parents under the root, journaling each
    pub fn mkdir_all(&mut self, dir: &Path) -> Result<()> {
        let mut missing = Vec::new();
        let mut cur = dir;
        while cur.starts_with(&self.root) && cur != self.root {
            match fs::symlink_metadata(cur) {
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => missing.push(cur.to_path_buf()),
                Err(e) => return Err(e.into()),
            }
            match cur.parent() {
                Some(parent) => cur = parent,
                None => break,
            }
        }
        for path in missing.into_iter().rev() {
            self.mkdir(&path, 0o755)?;
        }
        Ok(())
    }

    /// Remove `target`, keeping a copy until commit
    pub fn remove(&mut self, target: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(target)?;
        let inode = SavedInode::from_metadata(&meta);
        if meta.is_dir() {
            let entry = JournalEntry {
                kind: EntryKind::Remove,
                old: self.relative(target)?,
                new: None,
                inode: Some(inode),
            };
            self.record(entry)?;
            fs::remove_dir(target)?;
            return Ok(());
        }

        let saved = backup_name(target);
        let entry = JournalEntry {
            kind: EntryKind::Remove,
            old: self.relative(target)?,
            new: Some(self.relative(&saved)?),
            inode: Some(inode),
        };
        self.record(entry)?;
        preserve(target, &saved, &meta)?;
        fs::remove_file(target)?;
        Ok(())
    }

    /// Save whatever is at `target` before it gets replaced
    ///
    /// Directories only have their metadata saved. If nothing exists, a
    /// CREATE is recorded instead so a revert removes the new entry.
    /// Returns whether something existed.
    pub fn backup(&mut self, target: &Path) -> Result<bool> {
        let meta = match fs::symlink_metadata(target) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.create(target)?;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            self.backdir(target)?;
            return Ok(true);
        }

        let saved = backup_name(target);
        let entry = JournalEntry {
            kind: EntryKind::Backup,
            old: self.relative(target)?,
            new: Some(self.relative(&saved)?),
            inode: Some(SavedInode::from_metadata(&meta)),
        };
        self.record(entry)?;
        preserve(target, &saved, &meta)?;
        Ok(true)
    }

    /// Save a directory's metadata before it is changed
    pub fn backdir(&mut self, target: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(target)?;
        let entry = JournalEntry {
            kind: EntryKind::BackDir,
            old: self.relative(target)?,
            new: None,
            inode: Some(SavedInode::from_metadata(&meta)),
        };
        self.record(entry)
    }

    /// Remove `path` at commit time if it is an empty directory by then
    pub fn try_cleanup_dir(&mut self, path: &Path) -> Result<()> {
        let entry = JournalEntry {
            kind: EntryKind::TryCleanupDir,
            old: self.relative(path)?,
            new: None,
            inode: None,
        };
        self.record(entry)
    }

    /// Finish the apply: drop saved copies, remove emptied directories and
    /// delete the journal
    pub fn commit(mut self) -> Result<()> {
        if !self.is_committed() {
            let marker = JournalEntry {
                kind: EntryKind::Committed,
                old: String::new(),
                new: None,
                inode: None,
            };
            self.record(marker)?;
        }
        self.finish_commit();
        fs::remove_file(&self.path)?;
        log::debug!("Committed journal {}", self.path.display());
        Ok(())
    }

    fn finish_commit(&self) {
        // deepest directories first so parents can empty out
        let mut cleanup: Vec<PathBuf> = Vec::new();
        for entry in &self.entries {
            match entry.kind {
                EntryKind::Backup | EntryKind::Remove => {
                    if let Some(saved) = &entry.new {
                        let saved = self.absolute(saved);
                        if let Err(e) = fs::remove_file(&saved)
                            && e.kind() != std::io::ErrorKind::NotFound
                        {
                            log::warn!("could not remove {}: {}", saved.display(), e);
                        }
                    }
                }
                EntryKind::TryCleanupDir => cleanup.push(self.absolute(&entry.old)),
                _ => {}
            }
        }
        cleanup.sort();
        cleanup.dedup();
        for dir in cleanup.iter().rev() {
            // non-empty or already gone is fine
            let _ = fs::remove_dir(dir);
        }
    }

    /// Undo every recorded mutation, newest first
    ///
    /// Individual failures are logged and do not stop the replay. Returns
    /// the number of entries that could not be undone.
    pub fn revert(self) -> Result<usize> {
        if self.is_committed() {
            // the apply finished; only the cleanup is outstanding
            self.finish_commit();
            fs::remove_file(&self.path)?;
            return Ok(0);
        }

        let mut failures = 0;
        for entry in self.entries.iter().rev() {
            if let Err(e) = self.undo(entry) {
                failures += 1;
                log::error!("journal revert of {:?} {} failed: {}", entry.kind, entry.old, e);
            }
        }
        fs::remove_file(&self.path)?;
        log::info!(
            "Reverted journal {} ({} entries, {} failures)",
            self.path.display(),
            self.entries.len(),
            failures
        );
        Ok(failures)
    }

    fn undo(&self, entry: &JournalEntry) -> Result<()> {
        let target = self.absolute(&entry.old);
        match entry.kind {
            EntryKind::Rename => {
                let Some(new) = &entry.new else {
                    return Ok(());
                };
                let new = self.absolute(new);
                if exists(&new) && !exists(&target) {
                    fs::rename(&new, &target)?;
                }
            }
            EntryKind::Create => remove_any(&target)?,
            EntryKind::Mkdir => {
                if let Err(e) = fs::remove_dir(&target)
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    return Err(e.into());
                }
            }
            EntryKind::Backup | EntryKind::Remove => match &entry.new {
                Some(saved) => {
                    let saved = self.absolute(saved);
                    if !exists(&saved) {
                        // recorded but the copy was never made
                        return Ok(());
                    }
                    if let Ok(meta) = fs::symlink_metadata(&target)
                        && meta.is_dir()
                    {
                        fs::remove_dir(&target)?;
                    }
                    fs::rename(&saved, &target)?;
                    if let Some(inode) = &entry.inode {
                        let is_symlink = fs::symlink_metadata(&target)?.file_type().is_symlink();
                        inode.restore(&target, is_symlink)?;
                    }
                }
                None => {
                    // removed directory
                    if !exists(&target) {
                        fs::create_dir(&target)?;
                    }
                    if let Some(inode) = &entry.inode {
                        inode.restore(&target, false)?;
                    }
                }
            },
            EntryKind::BackDir => {
                if let Some(inode) = &entry.inode {
                    match fs::symlink_metadata(&target) {
                        Ok(meta) if meta.is_dir() => inode.restore(&target, false)?,
                        Ok(_) => {
                            fs::remove_file(&target)?;
                            fs::create_dir(&target)?;
                            inode.restore(&target, false)?;
                        }
                        Err(_) => {
                            fs::create_dir(&target)?;
                            inode.restore(&target, false)?;
                        }
                    }
                }
            }
            EntryKind::TryCleanupDir | EntryKind::Committed => {}
        }
        Ok(())
    }
}

/// Read every entry of a journal file, newest first
pub fn read_entries(path: &Path) -> Result<Vec<JournalEntry>> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    if size < 2 {
        return Err(Error::IncompleteHeader(format!(
            "journal {} has no header",
            path.display()
        )));
    }
    let mut header = [0u8; 2];
    file.read_exact(&mut header)?;
    let version = u16::from_be_bytes(header);
    if version != JOURNAL_VERSION {
        return Err(Error::InvalidMagic(format!(
            "journal {} has version {:#06x}",
            path.display(),
            version
        )));
    }

    let mut entries = Vec::new();
    let mut end = size;
    while end > 2 {
        if end < 2 + TRAILER_LEN {
            return Err(Error::ShortRead(format!("truncated journal {}", path.display())));
        }
        file.seek(SeekFrom::Start(end - TRAILER_LEN))?;
        let mut trailer = [0u8; 3];
        file.read_exact(&mut trailer)?;
        let kind = EntryKind::from_u8(trailer[0])?;
        let len = u16::from_be_bytes([trailer[1], trailer[2]]) as u64;
        let start = end
            .checked_sub(TRAILER_LEN + len)
            .filter(|s| *s >= 2)
            .ok_or_else(|| Error::ShortRead(format!("truncated journal {}", path.display())))?;
        file.seek(SeekFrom::Start(start))?;
        let mut body = vec![0u8; len as usize];
        file.read_exact(&mut body)?;
        entries.push(JournalEntry::decode(kind, &body)?);
        end = start;
    }
    Ok(entries)
}

fn backup_name(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = format!(".{}{}{}", name, SAVED_MARKER, uuid::Uuid::new_v4().simple());
    target.with_file_name(tmp)
}

const SAVED_MARKER: &str = ".ctbak-";

/// Whether a directory entry is a copy the journal keeps until commit
pub fn is_saved_copy(name: &std::ffi::OsStr) -> bool {
    let name = name.to_string_lossy();
    name.starts_with('.') && name.contains(SAVED_MARKER)
}

/// Keep a copy of `target` at `saved`: a hard link when possible
fn preserve(target: &Path, saved: &Path, meta: &fs::Metadata) -> Result<()> {
    if fs::hard_link(target, saved).is_ok() {
        return Ok(());
    }
    if meta.file_type().is_symlink() {
        std::os::unix::fs::symlink(fs::read_link(target)?, saved)?;
    } else if meta.is_file() {
        fs::copy(target, saved)?;
    } else {
        return Err(Error::IoError(format!(
            "cannot preserve special file {}",
            target.display()
        )));
    }
    Ok(())
}

fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn remove_any(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
