// src/update/apply.rs

//! Executing a planned filesystem job through the journal
//!
//! Order: renames, removals (deepest path first), restores sorted by
//! (path id, file id), then `.conflicts` files. Every mutation is journaled
//! first so the caller can revert on any error. Directories emptied by the
//! job are removed separately, after the database no longer claims them.

use super::merge::{FilesystemJob, Restore, RestoreSource};
use crate::changeset::{ChangeSet, ContentKind};
use crate::config::UpdateFlags;
use crate::db::store::AddOptions;
use crate::db::{ConfigCache, TroveStore};
use crate::error::{Error, Result};
use crate::files::{FileObject, RestoreContext};
use crate::filesystem::path::parent;
use crate::hash::{FileId, PathId, Sha1Digest};
use crate::progress::{Phase, UpdateCallback};
use crate::transaction::{CancelToken, JobJournal, is_saved_copy};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What applying needs besides the plan and the change set
pub struct ApplyContext<'a> {
    pub restore: &'a RestoreContext,
    pub config_cache: &'a ConfigCache,
    pub cancel: &'a CancelToken,
    pub callback: &'a dyn UpdateCallback,
    pub flags: UpdateFlags,
}

/// Bookkeeping while restores are written
struct Written {
    /// Where each (path id, file id) landed
    targets: BTreeMap<(PathId, FileId), PathBuf>,
    /// First path of each hard link group
    links: BTreeMap<Sha1Digest, PathBuf>,
    bytes: u64,
}

impl FilesystemJob {
    /// Carry out the plan; fails without touching anything if the plan has errors
    pub fn apply(&self, journal: &mut JobJournal, cs: &ChangeSet, ctx: &ApplyContext<'_>) -> Result<()> {
        self.check_errors()?;

        for (old, new) in self.renames() {
            ctx.cancel.check()?;
            let from = self.real_path(old)?;
            let to = self.real_path(new)?;
            if let Some(dir) = to.parent() {
                journal.mkdir_all(dir)?;
            }
            journal.backup(&to)?;
            debug!("renaming {} to {}", old, new);
            journal.rename(&from, &to)?;
        }

        ctx.callback.phase(Phase::RemovingFiles);
        self.apply_removes(journal, ctx)?;

        ctx.callback.phase(Phase::RestoringFiles);
        self.apply_restores(journal, cs, ctx)?;

        for (path, data) in self.new_files() {
            let target = self.real_path(path)?;
            journal.backup(&target)?;
            replace_contents(&target, data)?;
        }
        Ok(())
    }

    fn apply_removes(&self, journal: &mut JobJournal, ctx: &ApplyContext<'_>) -> Result<()> {
        let total = self.removes().count();
        for (n, (path, removal)) in self.removes().enumerate() {
            ctx.cancel.check()?;
            ctx.callback.removing_files(n + 1, total);
            let target = self.real_path(path)?;
            match fs::symlink_metadata(&target) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if !ctx.flags.contains(UpdateFlags::MISSING_FILES_OKAY) {
                        warn!("{} has already been removed", path);
                    }
                }
                Err(e) => return Err(e.into()),
                Ok(meta) if meta.is_dir() && !removal.object.is_directory() => {
                    warn!("{} is now a directory; leaving it alone", path);
                }
                Ok(_) => journal.remove(&target)?,
            }
        }
        Ok(())
    }

    fn apply_restores(&self, journal: &mut JobJournal, cs: &ChangeSet, ctx: &ApplyContext<'_>) -> Result<()> {
        let restores = self.restores();
        let pending: BTreeSet<(PathId, FileId)> = restores
            .iter()
            .filter_map(|r| match r.source {
                RestoreSource::ChangeSet { path_id, file_id } => Some((path_id, file_id)),
                _ => None,
            })
            .collect();

        let mut written = Written {
            targets: BTreeMap::new(),
            links: BTreeMap::new(),
            bytes: 0,
        };
        // unchanged link group members already on disk
        for (group, path) in self.link_groups() {
            written.links.insert(*group, self.real_path(path)?);
        }

        let mut delayed = Vec::new();
        for r in &restores {
            ctx.cancel.check()?;
            if !self.restore_one(journal, cs, ctx, r, &pending, &mut written)? {
                delayed.push(*r);
            }
        }

        // pointers whose target was written later in the pass
        for r in delayed {
            ctx.cancel.check()?;
            let RestoreSource::ChangeSet { path_id, file_id } = &r.source else {
                continue;
            };
            let (tp, tf) = match cs.get_contents(path_id, file_id).map(|e| &e.kind) {
                Some(ContentKind::Ptr { path_id, file_id }) => (*path_id, *file_id),
                _ => continue,
            };
            let source = written
                .targets
                .get(&(tp, tf))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("pointer target for {}", r.path)))?;
            let target = self.real_path(&r.path)?;
            let mut reader = File::open(&source)?;
            write_object(journal, &target, &r.object, Some(&mut reader), ctx.restore)?;
            self.finish_regular(ctx, r, &target, &mut written)?;
        }
        Ok(())
    }

    /// Returns false when the restore has to wait for its pointer target
    fn restore_one(
        &self,
        journal: &mut JobJournal,
        cs: &ChangeSet,
        ctx: &ApplyContext<'_>,
        r: &Restore,
        pending: &BTreeSet<(PathId, FileId)>,
        written: &mut Written,
    ) -> Result<bool> {
        let target = self.real_path(&r.path)?;
        if let Some(dir) = target.parent() {
            journal.mkdir_all(dir)?;
        }

        let (path_id, file_id) = match &r.source {
            RestoreSource::InodeOnly => {
                journal.backup(&target)?;
                r.object.apply_inode(&target, ctx.restore)?;
                return Ok(true);
            }
            RestoreSource::Data(data) => {
                write_object(journal, &target, &r.object, Some(&mut data.as_slice()), ctx.restore)?;
                if r.object.flags.is_config() {
                    ctx.config_cache.store(r.pristine.as_deref().unwrap_or(data.as_slice()))?;
                }
                written.bytes += data.len() as u64;
                ctx.callback.restoring_files(written.bytes, self.restore_size());
                return Ok(true);
            }
            RestoreSource::ChangeSet { path_id, file_id } => (*path_id, *file_id),
        };

        if !r.object.is_regular() {
            write_object(journal, &target, &r.object, None, ctx.restore)?;
            return Ok(true);
        }

        if let Some(group) = r.object.link_group
            && let Some(first) = written.links.get(&group)
            && *first != target
            && link_into_place(journal, first, &target)?
        {
            debug!("{} linked to {}", r.path, first.display());
            written.targets.insert((path_id, file_id), target);
            return Ok(true);
        }

        let entry = cs
            .get_contents(&path_id, &file_id)
            .ok_or_else(|| Error::NotFound(format!("contents of {} in the change set", r.path)))?;
        match &entry.kind {
            ContentKind::Regular => {
                let mut reader = entry.reader()?;
                write_object(journal, &target, &r.object, Some(&mut reader), ctx.restore)?;
            }
            ContentKind::Ptr {
                path_id: tp,
                file_id: tf,
            } => {
                if let Some(source) = written.targets.get(&(*tp, *tf)) {
                    let mut reader = File::open(source)?;
                    write_object(journal, &target, &r.object, Some(&mut reader), ctx.restore)?;
                } else if pending.contains(&(*tp, *tf)) {
                    return Ok(false);
                } else {
                    let data = cs
                        .get_contents(tp, tf)
                        .ok_or_else(|| Error::NotFound(format!("pointer target for {}", r.path)))?;
                    let mut reader = data.reader()?;
                    write_object(journal, &target, &r.object, Some(&mut reader), ctx.restore)?;
                }
            }
            ContentKind::Hldr => {
                match fs::symlink_metadata(&target) {
                    Ok(_) => debug!("{} has no captured contents; keeping what is there", r.path),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        journal.create(&target)?;
                        File::create(&target)?;
                        r.object.apply_inode(&target, ctx.restore)?;
                    }
                    Err(e) => return Err(e.into()),
                }
                return Ok(true);
            }
            ContentKind::Diff => {
                return Err(Error::IoError(format!(
                    "unresolved contents diff for {}",
                    r.path
                )));
            }
        }
        self.finish_regular(ctx, r, &target, written)?;
        Ok(true)
    }

    fn finish_regular(
        &self,
        ctx: &ApplyContext<'_>,
        r: &Restore,
        target: &Path,
        written: &mut Written,
    ) -> Result<()> {
        if let RestoreSource::ChangeSet { path_id, file_id } = r.source {
            written.targets.insert((path_id, file_id), target.to_path_buf());
        }
        if let Some(group) = r.object.link_group {
            written.links.entry(group).or_insert_with(|| target.to_path_buf());
        }
        if r.object.flags.is_config() {
            ctx.config_cache.store(&fs::read(target)?)?;
        }
        written.bytes += r.object.size();
        ctx.callback.restoring_files(written.bytes, self.restore_size());
        Ok(())
    }

    /// Record the job in the database
    ///
    /// Troves leaving the system are erased first, files taken over from
    /// troves that stay installed are dropped from them, then the new troves
    /// are added. Returns the contents digests of file streams that are no
    /// longer referenced.
    pub fn update_database(&self, store: &TroveStore<'_>) -> Result<Vec<Sha1Digest>> {
        let mut dropped = Vec::new();
        for old in self.old_troves() {
            dropped.extend(store.erase_trove(old)?);
        }
        for (tuple, paths) in self.user_removals() {
            if self.old_troves().contains(tuple) {
                continue;
            }
            let displaced: Vec<PathId> = paths
                .iter()
                .filter(|(_, replaced)| **replaced)
                .map(|(path_id, _)| *path_id)
                .collect();
            if !displaced.is_empty() && store.has_trove(tuple)? {
                store.remove_files_from_trove(tuple, &displaced)?;
            }
        }
        for trove in self.new_troves() {
            let tuple = trove.tuple();
            let opts = AddOptions {
                skip_paths: self.skip_paths_for(&tuple),
                shared_paths: self.shared_paths_for(&tuple),
                ..Default::default()
            };
            store.add_trove(trove, self.streams(), &opts)?;
        }
        Ok(dropped)
    }

    /// Remove directories the job emptied, deepest first
    ///
    /// Runs after the database update so ownership reflects the new state.
    /// A directory still holding copies the journal saved for this job is
    /// handed to the journal and goes away at commit. Returns how many were
    /// removed or scheduled.
    pub fn remove_directories(
        &self,
        journal: &mut JobJournal,
        store: &TroveStore<'_>,
        candidates: &[String],
    ) -> Result<usize> {
        let mut keep: BTreeSet<String> = BTreeSet::new();
        let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
        let mut removed = 0;
        for path in candidates {
            let target = self.real_path(path)?;
            let state = if keep.contains(path) || store.path_is_owned(path)? {
                DirState::InUse
            } else {
                dir_state(&target, &pending)
            };
            match state {
                DirState::InUse => {
                    if let Some(dir) = parent(path) {
                        keep.insert(dir.to_string());
                    }
                    continue;
                }
                DirState::Empty => {
                    debug!("removing empty directory {}", path);
                    journal.remove(&target)?;
                }
                DirState::OnlySaved => {
                    debug!("removing directory {} at commit", path);
                    journal.try_cleanup_dir(&target)?;
                    pending.insert(target);
                }
            }
            removed += 1;
        }
        Ok(removed)
    }
}

enum DirState {
    InUse,
    Empty,
    OnlySaved,
}

/// Classify a directory by what is left in it
///
/// Journal saved copies and directories already scheduled for cleanup do
/// not count as contents.
fn dir_state(target: &Path, pending: &BTreeSet<PathBuf>) -> DirState {
    let Ok(entries) = fs::read_dir(target) else {
        return DirState::InUse;
    };
    let mut state = DirState::Empty;
    for entry in entries {
        let Ok(entry) = entry else {
            return DirState::InUse;
        };
        if is_saved_copy(&entry.file_name()) || pending.contains(&entry.path()) {
            state = DirState::OnlySaved;
        } else {
            return DirState::InUse;
        }
    }
    state
}

/// Journal whatever is at `target`, then create `obj` there
fn write_object(
    journal: &mut JobJournal,
    target: &Path,
    obj: &FileObject,
    contents: Option<&mut dyn io::Read>,
    ctx: &RestoreContext,
) -> Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() && !obj.is_directory() => journal.remove(target)?,
        _ => {
            journal.backup(target)?;
        }
    }
    obj.restore(target, contents, ctx)
}

/// Write `data` to a fresh inode and rename it over `target`
///
/// The journal may hold the old inode as its saved copy.
fn replace_contents(target: &Path, data: &[u8]) -> Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| Error::InvalidPath(target.display().to_string()))?;
    let mut tmp = tempfile::Builder::new().prefix(".ct").tempfile_in(dir)?;
    tmp.as_file_mut().write_all(data)?;
    tmp.as_file_mut().flush()?;
    tmp.persist(target).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Hard link `target` to `first`; false when they are on different filesystems
fn link_into_place(journal: &mut JobJournal, first: &Path, target: &Path) -> Result<bool> {
    if journal.backup(target)? {
        fs::remove_file(target)?;
    }
    match fs::hard_link(first, target) {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
