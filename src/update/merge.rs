// src/update/merge.rs

//! Planning a filesystem job
//!
//! Each file of each trove in a change set is looked at in three versions:
//! the pristine version recorded for the installed trove (base), the version
//! the change set ships (head) and whatever is on disk now. The planner
//! decides per path whether to restore, rename, remove, merge or refuse, and
//! records everything the apply stage and the database update need.
//!
//! Problems with individual files are collected as [`MergeError`]s rather
//! than returned, so one run reports every conflict at once.

use super::conflicts::{Claim, MergeError, Resolution, resolve_duplicate};
use super::patch;
use crate::changeset::{ChangeSet, ContentKind};
use crate::config::UpdateFlags;
use crate::db::{ConfigCache, TroveStore};
use crate::error::{Error, Result};
use crate::files::{self, FileKind, FileObject, IdLookup};
use crate::filesystem::path::{parent, sanitize_path};
use crate::flavor::Flavor;
use crate::hash::{FileId, PathId, Sha1Digest};
use crate::label::LabelPath;
use crate::trove::{Trove, TroveFile, TroveTuple};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Everything the planner reads
pub struct MergeContext<'a, 'c> {
    pub store: &'a TroveStore<'c>,
    pub config_cache: &'a ConfigCache,
    pub root: &'a Path,
    pub flags: UpdateFlags,
    pub label_path: &'a LabelPath,
    pub ids: &'a IdLookup,
}

impl MergeContext<'_, '_> {
    fn has(&self, flag: UpdateFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Ownership only matters when it can be applied
    fn ignore_ugids(&self) -> bool {
        self.has(UpdateFlags::IGNORE_UGIDS) || !nix::unistd::geteuid().is_root()
    }
}

/// Where restored contents come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    /// The change set entry for the head (path id, file id)
    ChangeSet { path_id: PathId, file_id: FileId },
    /// Contents computed while planning: merged or patched config files
    Data(Vec<u8>),
    /// Leave the contents on disk and apply the metadata only
    InodeOnly,
}

/// One planned restore
#[derive(Debug, Clone)]
pub struct Restore {
    pub path: String,
    pub path_id: PathId,
    /// Head file id recorded in the database
    pub file_id: FileId,
    /// Object written to disk; may carry locally merged attributes
    pub object: FileObject,
    pub source: RestoreSource,
    /// Head contents of a config file restored from merged data
    pub pristine: Option<Vec<u8>>,
    pub owner: TroveTuple,
}

/// One planned removal
#[derive(Debug, Clone)]
pub struct Removal {
    pub object: FileObject,
    pub owner: TroveTuple,
}

/// A path that moved from an old trove to a new one
#[derive(Debug, Clone)]
struct MovedPath {
    new_owner: TroveTuple,
    path_id: PathId,
    old_object: FileObject,
    old_file_id: FileId,
    on_disk: bool,
}

/// A file present in both the base and head troves
struct ChangedFile<'t> {
    path_id: PathId,
    head: &'t TroveFile,
    base: FileObject,
    base_file_id: FileId,
    base_path: String,
    fs_path: String,
    on_disk: bool,
}

/// The plan for one job
#[derive(Debug, Default)]
pub struct FilesystemJob {
    root: PathBuf,
    restores: BTreeMap<String, Restore>,
    renames: Vec<(String, String)>,
    removes: BTreeMap<String, Removal>,
    /// Directories that may become empty, with the number of entries the job removes from them
    dir_counts: BTreeMap<String, usize>,
    new_files: Vec<(String, Vec<u8>)>,
    /// Per trove: path ids not owned on disk; `true` marks an installed owner displaced by this job
    user_removals: BTreeMap<TroveTuple, BTreeMap<PathId, bool>>,
    shared_paths: BTreeMap<TroveTuple, BTreeSet<String>>,
    new_troves: Vec<Trove>,
    old_troves: Vec<TroveTuple>,
    erased: Vec<TroveTuple>,
    tag_updates: BTreeMap<String, BTreeSet<String>>,
    tag_removes: BTreeMap<String, BTreeSet<String>>,
    link_groups: BTreeMap<Sha1Digest, String>,
    streams: BTreeMap<FileId, FileObject>,
    capsule_installs: Vec<TroveTuple>,
    capsule_removes: Vec<TroveTuple>,
    /// Conary-owned capsule files whose contents come from the foreign packager
    capsule_captures: Vec<(TroveTuple, PathId, String)>,
    errors: Vec<MergeError>,
    restore_size: u64,
    /// Installed troves this job erases or replaces
    leaving: BTreeSet<TroveTuple>,
}

impl FilesystemJob {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            ..Default::default()
        }
    }

    /// Plan the filesystem side of `cs`
    pub fn plan(ctx: &MergeContext<'_, '_>, cs: &ChangeSet) -> Result<Self> {
        let mut job = Self::new(ctx.root);
        job.leaving = cs
            .old_troves()
            .iter()
            .cloned()
            .chain(cs.trove_changes().filter_map(|c| c.old_tuple()))
            .collect();
        let moved = job.find_moved_paths(ctx, cs)?;

        for old in cs.old_troves() {
            let trove = ctx
                .store
                .get_trove(old, false)?
                .ok_or_else(|| Error::TroveMissing(old.to_string()))?;
            if trove.is_capsule() {
                job.capsule_removes.push(old.clone());
            }
            for tf in trove.files.values() {
                if moved.contains_key(&tf.path) {
                    continue;
                }
                let obj = stored_object(ctx, &tf.file_id)?;
                if trove.is_capsule() && obj.flags.is_encapsulated_content() {
                    continue;
                }
                if !obj.is_directory() && job.held_elsewhere(ctx, &tf.path)? {
                    debug!("{} stays; another trove owns it", tf.path);
                    continue;
                }
                job.remove(obj, &tf.path, old);
            }
            job.old_troves.push(old.clone());
            job.erased.push(old.clone());
        }

        let mut updates = Vec::new();
        for change in cs.trove_changes() {
            let (base, on_disk) = match change.old_tuple() {
                Some(old) => {
                    let base = ctx
                        .store
                        .get_trove(&old, true)?
                        .ok_or_else(|| Error::TroveMissing(old.to_string()))?;
                    let present = ctx
                        .store
                        .get_trove(&old, false)?
                        .ok_or_else(|| Error::TroveMissing(old.to_string()))?;
                    (Some(base), Some(present))
                }
                None => (None, None),
            };
            job.check_duplicate_paths(&change.new);
            updates.push((change, base, on_disk));
        }

        for (change, base, on_disk) in &updates {
            if let (Some(base), Some(on_disk)) = (base, on_disk) {
                job.setup_removes(ctx, &change.new, base, on_disk, &moved)?;
            }
        }

        for (change, base, on_disk) in &updates {
            if let Some(old) = change.old_tuple() {
                job.old_troves.push(old);
            }
            if change.new.is_capsule() {
                job.capsule_installs.push(change.new_tuple());
            }
            job.single_trove(ctx, cs, &change.new, base.as_ref(), on_disk.as_ref(), &moved)?;
            job.new_troves.push(change.new.clone());
        }

        debug!(
            "planned {} restores, {} removes, {} renames, {} errors",
            job.restores.len(),
            job.removes.len(),
            job.renames.len(),
            job.errors.len()
        );
        Ok(job)
    }

    /// Paths dropped by an old or erased trove and picked up by a new one
    fn find_moved_paths(
        &self,
        ctx: &MergeContext<'_, '_>,
        cs: &ChangeSet,
    ) -> Result<BTreeMap<String, MovedPath>> {
        // path -> (old file id, still on disk)
        let mut dropped: BTreeMap<String, (FileId, bool)> = BTreeMap::new();

        for old in cs.old_troves() {
            let Some(pristine) = ctx.store.get_trove(old, true)? else {
                continue;
            };
            let present = ctx.store.get_trove(old, false)?;
            for (path_id, tf) in &pristine.files {
                let on_disk = present.as_ref().is_some_and(|t| t.files.contains_key(path_id));
                dropped.entry(tf.path.clone()).or_insert((tf.file_id, on_disk));
            }
        }
        for change in cs.trove_changes() {
            let Some(old) = change.old_tuple() else {
                continue;
            };
            let Some(pristine) = ctx.store.get_trove(&old, true)? else {
                continue;
            };
            let present = ctx.store.get_trove(&old, false)?;
            for (path_id, tf) in &pristine.files {
                if change.new.files.contains_key(path_id) {
                    continue;
                }
                let on_disk = present.as_ref().is_some_and(|t| t.files.contains_key(path_id));
                dropped.entry(tf.path.clone()).or_insert((tf.file_id, on_disk));
            }
        }
        if dropped.is_empty() {
            return Ok(BTreeMap::new());
        }

        let mut moved = BTreeMap::new();
        for change in cs.trove_changes() {
            let base_ids: BTreeSet<PathId> = match change.old_tuple() {
                Some(old) => ctx
                    .store
                    .get_trove(&old, true)?
                    .map(|t| t.files.keys().copied().collect())
                    .unwrap_or_default(),
                None => BTreeSet::new(),
            };
            for (path_id, tf) in &change.new.files {
                if base_ids.contains(path_id) || moved.contains_key(&tf.path) {
                    continue;
                }
                if let Some((old_file_id, on_disk)) = dropped.get(&tf.path) {
                    debug!("{} moves to {}", tf.path, change.new.name);
                    moved.insert(
                        tf.path.clone(),
                        MovedPath {
                            new_owner: change.new_tuple(),
                            path_id: *path_id,
                            old_object: stored_object(ctx, old_file_id)?,
                            old_file_id: *old_file_id,
                            on_disk: *on_disk,
                        },
                    );
                }
            }
        }
        Ok(moved)
    }

    fn check_duplicate_paths(&mut self, trove: &Trove) {
        let mut seen = BTreeSet::new();
        for tf in trove.files.values() {
            if !seen.insert(tf.path.as_str()) {
                self.errors.push(MergeError::DuplicatePath {
                    path: tf.path.clone(),
                    trove: trove.tuple().to_string(),
                });
            }
        }
    }

    /// Files the update drops from an installed trove
    fn setup_removes(
        &mut self,
        ctx: &MergeContext<'_, '_>,
        new: &Trove,
        base: &Trove,
        on_disk: &Trove,
        moved: &BTreeMap<String, MovedPath>,
    ) -> Result<()> {
        let owner = base.tuple();
        for (path_id, tf) in &base.files {
            if new.files.contains_key(path_id) || moved.contains_key(&tf.path) {
                continue;
            }
            let Some(present) = on_disk.files.get(path_id) else {
                debug!("{} was already removed", tf.path);
                continue;
            };
            let old = stored_object(ctx, &tf.file_id)?;
            if base.is_capsule() && old.flags.is_encapsulated_content() {
                continue;
            }
            if !old.is_directory() && self.held_elsewhere(ctx, &present.path)? {
                debug!("{} stays; another trove owns it", present.path);
                continue;
            }

            if ctx.has(UpdateFlags::MERGE) {
                let real = self.real_path(&present.path)?;
                let Some(local) = FileObject::from_path(&real, ctx.ids, Some(&old))? else {
                    debug!("{} is already gone", present.path);
                    continue;
                };
                if local.is_directory() && !old.is_directory() {
                    warn!("{} is now a directory; not removing it", present.path);
                    continue;
                }
                if old.is_regular() && !old.flags.is_transient() && !local.contents_eq(&old) {
                    warn!("{} has changed but has been removed on head", present.path);
                }
            }
            self.remove(old, &present.path, &owner);
        }
        Ok(())
    }

    fn single_trove(
        &mut self,
        ctx: &MergeContext<'_, '_>,
        cs: &ChangeSet,
        new: &Trove,
        base: Option<&Trove>,
        on_disk: Option<&Trove>,
        moved: &BTreeMap<String, MovedPath>,
    ) -> Result<()> {
        let tuple = new.tuple();

        for (path_id, tf) in &new.files {
            if base.is_some_and(|b| b.files.contains_key(path_id)) {
                continue;
            }
            if moved.get(&tf.path).is_some_and(|m| m.new_owner == tuple) {
                continue;
            }
            let head = head_object(ctx, cs, None, &tf.file_id)?;
            self.streams.insert(tf.file_id, head.clone());
            if new.is_capsule() && self.capsule_owned(cs, &tuple, *path_id, tf, &head) {
                continue;
            }
            self.new_file(ctx, cs, &tuple, *path_id, tf, head)?;
        }

        if let Some(base) = base {
            for (path_id, tf) in &new.files {
                let Some(base_tf) = base.files.get(path_id) else {
                    continue;
                };
                let present = on_disk.and_then(|t| t.files.get(path_id));
                if base_tf.file_id == tf.file_id && base_tf.path == tf.path {
                    // the old trove's erase may drop the only stored copy
                    if !self.streams.contains_key(&tf.file_id) {
                        let kept = stored_object(ctx, &base_tf.file_id)?;
                        self.streams.insert(tf.file_id, kept);
                    }
                    if present.is_none() {
                        self.user_removal(&tuple, *path_id, false);
                    }
                    continue;
                }
                let change = ChangedFile {
                    path_id: *path_id,
                    head: tf,
                    base: stored_object(ctx, &base_tf.file_id)?,
                    base_file_id: base_tf.file_id,
                    base_path: base_tf.path.clone(),
                    fs_path: present.map_or_else(|| base_tf.path.clone(), |p| p.path.clone()),
                    on_disk: present.is_some(),
                };
                self.changed_file(ctx, cs, new, change)?;
            }
        }

        for (path, m) in moved {
            if m.new_owner != tuple {
                continue;
            }
            let Some(tf) = new.files.get(&m.path_id) else {
                continue;
            };
            let change = ChangedFile {
                path_id: m.path_id,
                head: tf,
                base: m.old_object.clone(),
                base_file_id: m.old_file_id,
                base_path: path.clone(),
                fs_path: path.clone(),
                on_disk: m.on_disk,
            };
            self.changed_file(ctx, cs, new, change)?;
        }
        Ok(())
    }

    /// Capsule files the foreign packager writes; returns true when Conary
    /// has nothing to restore
    fn capsule_owned(
        &mut self,
        cs: &ChangeSet,
        tuple: &TroveTuple,
        path_id: PathId,
        tf: &TroveFile,
        head: &FileObject,
    ) -> bool {
        if head.flags.is_encapsulated_content() {
            return true;
        }
        let captured = cs
            .get_contents(&path_id, &tf.file_id)
            .is_some_and(|e| !matches!(e.kind, ContentKind::Hldr));
        if head.is_regular() && !captured {
            self.capsule_captures.push((tuple.clone(), path_id, tf.path.clone()));
            return true;
        }
        false
    }

    fn new_file(
        &mut self,
        ctx: &MergeContext<'_, '_>,
        cs: &ChangeSet,
        tuple: &TroveTuple,
        path_id: PathId,
        tf: &TroveFile,
        head: FileObject,
    ) -> Result<()> {
        let real = self.real_path(&tf.path)?;
        let disk = match fs::symlink_metadata(&real) {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let mut restore = true;
        if let Some(meta) = disk {
            if head.is_directory() && meta.is_dir() {
                if ctx.store.path_is_owned(&tf.path)? {
                    restore = false;
                    self.share(tuple, &tf.path);
                }
            } else if meta.is_dir() {
                if fs::read_dir(&real)?.next().is_some() {
                    self.errors.push(MergeError::DirectoryInWay {
                        path: tf.path.clone(),
                        trove: tuple.to_string(),
                    });
                    return Ok(());
                }
            } else if head.flags.is_initial_contents()
                && !ctx.has(UpdateFlags::IGNORE_INITIAL_CONTENTS)
                && !self.removes.contains_key(&tf.path)
            {
                debug!("keeping existing contents of {}", tf.path);
                restore = false;
            } else if !self.removes.contains_key(&tf.path) {
                let owners = ctx.store.iter_find_path(&tf.path)?;
                let mut conflict = true;
                if owners.iter().any(|o| o.file_id == tf.file_id) {
                    restore = false;
                    conflict = false;
                } else if !owners.is_empty() {
                    let new_label = tuple.version.trailing_label();
                    for owner in &owners {
                        let old_label = owner.tuple.version.trailing_label();
                        if ctx.label_path.outranks(new_label, old_label) {
                            conflict = false;
                        } else if ctx.label_path.outranks(old_label, new_label) {
                            debug!("{} stays with higher priority {}", tf.path, owner.tuple);
                            conflict = false;
                            restore = false;
                            self.user_removal(tuple, path_id, false);
                        }
                    }
                    if conflict && ctx.has(UpdateFlags::REPLACE_MANAGED_FILES) {
                        conflict = false;
                    }
                    if restore && !conflict {
                        for owner in &owners {
                            info!("{} takes {} from {}", tuple, tf.path, owner.tuple);
                            self.user_removal(&owner.tuple, owner.path_id, true);
                        }
                    }
                    if restore && conflict {
                        let owner = owners
                            .iter()
                            .map(|o| o.tuple.to_string())
                            .collect::<Vec<_>>()
                            .join(", ");
                        self.errors.push(MergeError::DatabasePathConflict {
                            path: tf.path.clone(),
                            trove: tuple.to_string(),
                            owner,
                        });
                        return Ok(());
                    }
                } else {
                    if head.flags.is_transient() {
                        conflict = false;
                    } else if let Some(existing) = FileObject::from_path(&real, ctx.ids, Some(&head))?
                        && silently_replace(&head, &existing)
                    {
                        conflict = false;
                    }
                    if conflict && ctx.has(UpdateFlags::REPLACE_UNMANAGED_FILES) {
                        conflict = false;
                    }
                    if restore && conflict {
                        self.errors.push(MergeError::FileInWay {
                            path: tf.path.clone(),
                            trove: tuple.to_string(),
                        });
                        return Ok(());
                    }
                }
            }
        }

        if restore {
            self.restore(
                ctx,
                cs,
                Restore {
                    path: tf.path.clone(),
                    path_id,
                    file_id: tf.file_id,
                    object: head,
                    source: RestoreSource::ChangeSet {
                        path_id,
                        file_id: tf.file_id,
                    },
                    pristine: None,
                    owner: tuple.clone(),
                },
            );
        }
        Ok(())
    }

    fn changed_file(
        &mut self,
        ctx: &MergeContext<'_, '_>,
        cs: &ChangeSet,
        new: &Trove,
        c: ChangedFile<'_>,
    ) -> Result<()> {
        let tuple = new.tuple();
        let head_tf = c.head;
        let head = head_object(ctx, cs, Some((&c.base, c.base_file_id)), &head_tf.file_id)?;
        self.streams.insert(head_tf.file_id, head.clone());

        if !c.on_disk {
            debug!("{} is not on the system; leaving it off", c.fs_path);
            self.user_removal(&tuple, c.path_id, false);
            return Ok(());
        }
        if new.is_capsule() && head.flags.is_encapsulated_content() {
            return Ok(());
        }

        let mut final_path = c.fs_path.clone();
        if head_tf.path != c.fs_path {
            if !ctx.has(UpdateFlags::MERGE) || c.fs_path == c.base_path {
                self.renames.push((c.fs_path.clone(), head_tf.path.clone()));
                final_path = head_tf.path.clone();
            } else {
                self.errors.push(MergeError::PathConflict {
                    path: c.fs_path.clone(),
                    head_path: head_tf.path.clone(),
                });
            }
        }
        if head_tf.file_id == c.base_file_id {
            return Ok(());
        }

        let ignore_ugids = ctx.ignore_ugids();
        let disk_path = self.real_path(&c.fs_path)?;
        let Some(mut local) = FileObject::from_path(&disk_path, ctx.ids, Some(&c.base))? else {
            if !ctx.has(UpdateFlags::MISSING_FILES_OKAY) {
                warn!("{} is missing; restoring it", c.fs_path);
            }
            return self.restore_head(ctx, cs, &tuple, &c, &final_path, head);
        };
        if local.is_regular() && c.base.is_regular() {
            local.link_group = c.base.link_group;
        }
        local.flags = head.flags;
        local.tags = head.tags.clone();
        local.provides = head.provides.clone();
        local.requires = head.requires.clone();
        local.flavor = head.flavor.clone();

        let mut attrs_changed = false;
        let mut force = false;
        if !c.base.kind.same_type(&head.kind) {
            if c.base.is_directory() && local.is_directory() {
                let err = match &head.kind {
                    FileKind::Symlink { target } => MergeError::DirectoryToSymLink {
                        path: final_path.clone(),
                        target: target.clone(),
                    },
                    _ => MergeError::DirectoryToNonDirectory {
                        path: final_path.clone(),
                    },
                };
                self.errors.push(err);
                return Ok(());
            }
            if c.base.is_directory()
                || ctx.has(UpdateFlags::REPLACE_MANAGED_FILES)
                || c.base.kind.same_type(&local.kind)
            {
                force = true;
                attrs_changed = true;
                local = head.clone();
            } else {
                self.errors.push(MergeError::FileTypeChanged { path: final_path });
                return Ok(());
            }
        } else if !c.base.kind.same_type(&local.kind) {
            if ctx.has(UpdateFlags::REPLACE_MODIFIED_FILES) {
                force = true;
                attrs_changed = true;
                local = head.clone();
            } else {
                self.errors.push(MergeError::FileTypeChanged { path: final_path });
                return Ok(());
            }
        }

        if !force && !local.disk_eq(&head, ignore_ugids) {
            if ctx.has(UpdateFlags::MERGE) {
                let mut merged = local.clone();
                if merged.is_regular() {
                    // contents are merged below
                    merged.kind = c.base.kind.clone();
                }
                if merged.twm(&head.diff(&c.base), &c.base, ignore_ugids)? {
                    local.perms = merged.perms;
                    local.owner = merged.owner;
                    local.group = merged.group;
                    local.mtime = merged.mtime;
                    if !local.is_regular() {
                        local.kind = merged.kind;
                    }
                    attrs_changed = true;
                } else {
                    self.errors.push(MergeError::FileAttributesConflict {
                        path: final_path.clone(),
                    });
                    return Ok(());
                }
            } else {
                local.perms = head.perms;
                local.owner = head.owner.clone();
                local.group = head.group.clone();
                local.mtime = head.mtime;
                if !local.is_regular() {
                    local.kind = head.kind.clone();
                }
                attrs_changed = true;
            }
        }

        let head_sha = head.contents_sha1();
        let local_sha = local.contents_sha1();
        let base_sha = c.base.contents_sha1();
        let contents_changed =
            head.is_regular() && head_sha != local_sha && head_sha != base_sha;

        if force {
            return self.restore_head(ctx, cs, &tuple, &c, &final_path, local);
        }
        if contents_changed {
            if head.flags.is_initial_contents() && !ctx.has(UpdateFlags::IGNORE_INITIAL_CONTENTS) {
                debug!("not replacing initial contents of {}", final_path);
            } else if ctx.has(UpdateFlags::REPLACE_MODIFIED_FILES)
                || !ctx.has(UpdateFlags::MERGE)
                || head.flags.is_transient()
                || local_sha == base_sha
            {
                local.kind = head.kind.clone();
                return self.restore_head(ctx, cs, &tuple, &c, &final_path, local);
            } else if head.flags.is_config() && !c.base.flags.is_config() {
                warn!("preserving contents of {} (now a config file)", final_path);
            } else if head.flags.is_config() {
                return self.merge_config(ctx, cs, &tuple, &c, &final_path, &disk_path, local);
            } else {
                self.errors.push(MergeError::FileContentsConflict { path: final_path });
                return Ok(());
            }
        } else if head.is_regular()
            && let Some(group) = head.link_group
        {
            self.link_groups.entry(group).or_insert_with(|| final_path.clone());
        }

        if attrs_changed {
            // only regular files can keep their contents; others are recreated
            let source = if local.is_regular() {
                RestoreSource::InodeOnly
            } else {
                RestoreSource::ChangeSet {
                    path_id: c.path_id,
                    file_id: head_tf.file_id,
                }
            };
            self.restore(
                ctx,
                cs,
                Restore {
                    path: final_path,
                    path_id: c.path_id,
                    file_id: head_tf.file_id,
                    object: local,
                    source,
                    pristine: None,
                    owner: tuple,
                },
            );
        }
        Ok(())
    }

    /// Restore the head contents of a changed file
    fn restore_head(
        &mut self,
        ctx: &MergeContext<'_, '_>,
        cs: &ChangeSet,
        tuple: &TroveTuple,
        c: &ChangedFile<'_>,
        final_path: &str,
        object: FileObject,
    ) -> Result<()> {
        let file_id = c.head.file_id;
        let source = match cs.get_contents(&c.path_id, &file_id) {
            Some(entry) if entry.kind == ContentKind::Diff => {
                let text = read_head(ctx, cs, c.path_id, file_id, c.base.contents_sha1())?;
                RestoreSource::Data(text)
            }
            Some(_) => RestoreSource::ChangeSet {
                path_id: c.path_id,
                file_id,
            },
            None if object.is_regular() => {
                return Err(Error::NotFound(format!(
                    "contents of {} are not in the change set",
                    final_path
                )));
            }
            None => RestoreSource::ChangeSet {
                path_id: c.path_id,
                file_id,
            },
        };
        self.restore(
            ctx,
            cs,
            Restore {
                path: final_path.to_string(),
                path_id: c.path_id,
                file_id,
                object,
                source,
                pristine: None,
                owner: tuple.clone(),
            },
        );
        Ok(())
    }

    /// Three-way merge of a locally edited config file
    #[allow(clippy::too_many_arguments)]
    fn merge_config(
        &mut self,
        ctx: &MergeContext<'_, '_>,
        cs: &ChangeSet,
        tuple: &TroveTuple,
        c: &ChangedFile<'_>,
        final_path: &str,
        disk_path: &Path,
        mut local: FileObject,
    ) -> Result<()> {
        let base_sha = c.base.contents_sha1();
        let base = match base_sha {
            Some(sha1) => ctx.config_cache.get(&sha1)?,
            None => None,
        };
        let head = read_head(ctx, cs, c.path_id, c.head.file_id, base_sha)?;
        let current = fs::read(disk_path)?;

        let texts = base.as_deref().map(String::from_utf8_lossy).zip(
            std::str::from_utf8(&current)
                .ok()
                .zip(std::str::from_utf8(&head).ok()),
        );
        let Some((base, (current, head))) = texts else {
            debug!("no text base for {}; cannot merge", final_path);
            self.errors.push(MergeError::FileContentsConflict {
                path: final_path.to_string(),
            });
            return Ok(());
        };

        let outcome = patch::three_way(&base, current, head);
        if !outcome.is_clean() {
            warn!(
                "{} hunk(s) of {} did not apply; see {}.conflicts",
                outcome.failed.len(),
                final_path,
                final_path
            );
            self.new_files.push((
                format!("{}.conflicts", final_path),
                outcome.conflicts().into_bytes(),
            ));
        }
        let merged = outcome.text.into_bytes();
        local.set_contents(&merged);
        self.restore(
            ctx,
            cs,
            Restore {
                path: final_path.to_string(),
                path_id: c.path_id,
                file_id: c.head.file_id,
                object: local,
                source: RestoreSource::Data(merged),
                pristine: Some(head.as_bytes().to_vec()),
                owner: tuple.clone(),
            },
        );
        Ok(())
    }

    /// Queue a restore, settling paths another trove in this job already claimed
    fn restore(&mut self, ctx: &MergeContext<'_, '_>, cs: &ChangeSet, r: Restore) {
        if let Some(prev) = self.restores.get(&r.path) {
            let existing = Claim {
                owner: &prev.owner,
                file_id: prev.file_id,
                encapsulated: prev.object.flags.is_encapsulated_content(),
                elf_class: restore_elf_class(cs, prev),
            };
            let incoming = Claim {
                owner: &r.owner,
                file_id: r.file_id,
                encapsulated: r.object.flags.is_encapsulated_content(),
                elf_class: restore_elf_class(cs, &r),
            };
            match resolve_duplicate(
                &r.path,
                &existing,
                &incoming,
                ctx.label_path,
                ctx.has(UpdateFlags::REPLACE_MANAGED_FILES),
            ) {
                Resolution::Share | Resolution::ShareExisting => {
                    self.share(&r.owner, &r.path);
                    return;
                }
                Resolution::KeepExisting => {
                    self.user_removal(&r.owner, r.path_id, false);
                    return;
                }
                Resolution::TakeNew => {
                    let (owner, path_id) = (prev.owner.clone(), prev.path_id);
                    self.user_removal(&owner, path_id, false);
                }
                Resolution::Conflict => {
                    self.errors.push(MergeError::DatabasePathConflict {
                        path: r.path.clone(),
                        trove: r.owner.to_string(),
                        owner: prev.owner.to_string(),
                    });
                    return;
                }
            }
        }

        for tag in &r.object.tags {
            self.tag_updates
                .entry(tag.clone())
                .or_default()
                .insert(r.path.clone());
        }
        if r.source != RestoreSource::InodeOnly {
            self.restore_size += r.object.size();
        }
        self.restores.insert(r.path.clone(), r);
    }

    fn remove(&mut self, object: FileObject, path: &str, owner: &TroveTuple) {
        for tag in &object.tags {
            self.tag_removes
                .entry(tag.clone())
                .or_default()
                .insert(path.to_string());
        }
        if object.is_directory() {
            self.dir_counts.entry(path.to_string()).or_insert(0);
            return;
        }
        if let Some(dir) = parent(path) {
            *self.dir_counts.entry(dir.to_string()).or_insert(0) += 1;
        }
        self.removes.insert(
            path.to_string(),
            Removal {
                object,
                owner: owner.clone(),
            },
        );
    }

    /// True when an installed trove outside this job still owns `path`
    fn held_elsewhere(&self, ctx: &MergeContext<'_, '_>, path: &str) -> Result<bool> {
        Ok(ctx
            .store
            .iter_find_path(path)?
            .iter()
            .any(|o| !self.leaving.contains(&o.tuple)))
    }

    fn user_removal(&mut self, tuple: &TroveTuple, path_id: PathId, replaced: bool) {
        self.user_removals
            .entry(tuple.clone())
            .or_default()
            .insert(path_id, replaced);
    }

    fn share(&mut self, tuple: &TroveTuple, path: &str) {
        self.shared_paths
            .entry(tuple.clone())
            .or_default()
            .insert(path.to_string());
    }

    pub(super) fn real_path(&self, path: &str) -> Result<PathBuf> {
        Ok(self.root.join(sanitize_path(path)?))
    }

    /// Directories that may be left empty, deepest first
    ///
    /// A directory qualifies when everything in it is removed by this job or
    /// is itself a qualifying directory. Computed against the disk before
    /// anything is applied.
    pub fn directory_candidates(&self) -> Result<Vec<String>> {
        let mut counts = self.dir_counts.clone();
        let mut pending: BTreeSet<String> = counts.keys().cloned().collect();
        let mut candidates = Vec::new();

        while let Some(path) = pending.pop_last() {
            if path == "/" {
                continue;
            }
            let real = self.real_path(&path)?;
            let entries = match fs::read_dir(&real) {
                Ok(rd) => rd.count(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => continue,
                Err(e) => return Err(e.into()),
            };
            if entries != counts.get(&path).copied().unwrap_or(0) {
                continue;
            }
            if let Some(dir) = parent(&path) {
                *counts.entry(dir.to_string()).or_insert(0) += 1;
                pending.insert(dir.to_string());
            }
            candidates.push(path);
        }
        candidates.sort_by(|a, b| b.cmp(a));
        Ok(candidates)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Restores in (path id, file id) order
    pub fn restores(&self) -> Vec<&Restore> {
        let mut out: Vec<&Restore> = self.restores.values().collect();
        out.sort_by(|a, b| (a.path_id, a.file_id, &a.path).cmp(&(b.path_id, b.file_id, &b.path)));
        out
    }

    pub fn renames(&self) -> &[(String, String)] {
        &self.renames
    }

    /// Removals, deepest path first
    pub fn removes(&self) -> impl Iterator<Item = (&String, &Removal)> {
        self.removes.iter().rev()
    }

    pub fn new_files(&self) -> &[(String, Vec<u8>)] {
        &self.new_files
    }

    pub fn user_removals(&self) -> &BTreeMap<TroveTuple, BTreeMap<PathId, bool>> {
        &self.user_removals
    }

    /// Paths approved for sharing when `tuple` is added to the database
    pub fn shared_paths_for(&self, tuple: &TroveTuple) -> BTreeSet<String> {
        self.shared_paths.get(tuple).cloned().unwrap_or_default()
    }

    /// Path ids `tuple` records without owning them on disk
    pub fn skip_paths_for(&self, tuple: &TroveTuple) -> BTreeSet<PathId> {
        self.user_removals
            .get(tuple)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn new_troves(&self) -> &[Trove] {
        &self.new_troves
    }

    pub fn new_troves_mut(&mut self) -> &mut Vec<Trove> {
        &mut self.new_troves
    }

    /// Installed troves leaving the system, erased or updated
    pub fn old_troves(&self) -> &[TroveTuple] {
        &self.old_troves
    }

    /// Troves erased outright
    pub fn erased(&self) -> &[TroveTuple] {
        &self.erased
    }

    pub fn tag_updates(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.tag_updates
    }

    pub fn tag_removes(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.tag_removes
    }

    pub fn link_groups(&self) -> &BTreeMap<Sha1Digest, String> {
        &self.link_groups
    }

    pub fn streams(&self) -> &BTreeMap<FileId, FileObject> {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut BTreeMap<FileId, FileObject> {
        &mut self.streams
    }

    pub fn capsule_installs(&self) -> &[TroveTuple] {
        &self.capsule_installs
    }

    pub fn capsule_removes(&self) -> &[TroveTuple] {
        &self.capsule_removes
    }

    pub fn capsule_captures(&self) -> &[(TroveTuple, PathId, String)] {
        &self.capsule_captures
    }

    pub fn errors(&self) -> &[MergeError] {
        &self.errors
    }

    /// Bytes of contents the job writes
    pub fn restore_size(&self) -> u64 {
        self.restore_size
    }

    /// Fail with every collected merge error
    pub fn check_errors(&self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::CommitError(self.errors.clone()))
        }
    }
}

fn stored_object(ctx: &MergeContext<'_, '_>, file_id: &FileId) -> Result<FileObject> {
    ctx.store
        .get_file_stream(file_id)?
        .ok_or_else(|| Error::FileStreamMissing(file_id.to_string()))
}

/// Head object from the change set, falling back to the database
fn head_object(
    ctx: &MergeContext<'_, '_>,
    cs: &ChangeSet,
    base: Option<(&FileObject, FileId)>,
    file_id: &FileId,
) -> Result<FileObject> {
    if let Some(obj) = cs.get_file(base, *file_id)? {
        return Ok(obj);
    }
    stored_object(ctx, file_id)
}

/// Full head contents, applying a shipped diff to the cached base
fn read_head(
    ctx: &MergeContext<'_, '_>,
    cs: &ChangeSet,
    path_id: PathId,
    file_id: FileId,
    base_sha: Option<Sha1Digest>,
) -> Result<Vec<u8>> {
    let entry = cs
        .resolve_contents(&path_id, &file_id)
        .ok_or_else(|| Error::NotFound(format!("contents for {}", file_id)))?;
    match entry.kind {
        ContentKind::Diff => {
            let base = match base_sha {
                Some(sha1) => ctx.config_cache.get(&sha1)?,
                None => None,
            }
            .ok_or_else(|| Error::NotFound(format!("cached config contents for {}", file_id)))?;
            let diff = entry.read_all()?;
            let outcome = patch::apply(
                &String::from_utf8_lossy(&base),
                &String::from_utf8_lossy(&diff),
            )?;
            if !outcome.is_clean() {
                return Err(Error::IoError(format!(
                    "config diff for {} does not apply to its base",
                    file_id
                )));
            }
            Ok(outcome.text.into_bytes())
        }
        ContentKind::Hldr => Ok(Vec::new()),
        _ => entry.read_all(),
    }
}

/// An unowned file that matches the incoming one closely enough to take over
fn silently_replace(new: &FileObject, existing: &FileObject) -> bool {
    new.kind.same_type(&existing.kind) && new.contents_eq(existing)
}

fn restore_elf_class(cs: &ChangeSet, r: &Restore) -> Option<u8> {
    let from_contents = match &r.source {
        RestoreSource::Data(data) => files::elf_class(data),
        RestoreSource::ChangeSet { path_id, file_id } => cs
            .resolve_contents(path_id, file_id)
            .filter(|e| e.kind == ContentKind::Regular)
            .and_then(|e| e.reader().ok())
            .and_then(|reader| read_prefix(reader, 64).ok())
            .and_then(|head| files::elf_class(&head)),
        RestoreSource::InodeOnly => None,
    };
    from_contents.or_else(|| flavor_elf_class(&r.object.flavor))
}

/// ELF class implied by a flavor's instruction set
pub fn flavor_elf_class(flavor: &Flavor) -> Option<u8> {
    flavor.architectures().next().map(|arch| {
        if arch.name.ends_with("64") || arch.name == "s390x" {
            64
        } else {
            32
        }
    })
}

/// First `len` bytes of a stream, enough for an ELF header
fn read_prefix(reader: impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len);
    reader.take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}
