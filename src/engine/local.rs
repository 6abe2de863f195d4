// src/engine/local.rs

//! Local changes: how the filesystem differs from the installed database
//!
//! [`verify`] compares each file of a trove against what is on disk.
//! [`local_changeset`] turns those differences into the `A -> A.local`
//! change set kept as the local half of a rollback, and [`apply_local`]
//! writes such a change set back once the repository half has been rolled
//! back.

use crate::changeset::{ChangeSet, ChangeSetBuilder, TroveChange};
use crate::db::TroveStore;
use crate::error::{Error, Result};
use crate::files::{FileObject, IdLookup, RestoreContext};
use crate::filesystem::path::safe_join;
use crate::hash::{FileId, PathId};
use crate::transaction::JobJournal;
use crate::trove::TroveTuple;
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// One file whose on-disk state differs from the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
    pub path_id: PathId,
    pub path: String,
    pub expected_id: FileId,
    pub expected: FileObject,
    /// What is on disk; `None` when the file was removed
    pub found: Option<FileObject>,
}

impl LocalChange {
    pub fn is_removed(&self) -> bool {
        self.found.is_none()
    }
}

/// Compare every file of `tuple` with the filesystem
///
/// Files a foreign packager manages inside capsule troves are skipped.
pub fn verify(
    store: &TroveStore<'_>,
    root: &Path,
    ids: &IdLookup,
    tuple: &TroveTuple,
    ignore_ugids: bool,
) -> Result<Vec<LocalChange>> {
    let trove = store
        .get_trove(tuple, false)?
        .ok_or_else(|| Error::TroveMissing(tuple.to_string()))?;
    let capsule = trove.is_capsule();

    let mut changes = Vec::new();
    for file in store.get_trove_files(tuple)? {
        if !trove.files.contains_key(&file.path_id) {
            continue;
        }
        if capsule && file.object.flags.is_encapsulated_content() {
            continue;
        }
        let target = safe_join(root, &file.path)?;
        let found = FileObject::from_path(&target, ids, Some(&file.object))?;
        let changed = match &found {
            None => true,
            Some(disk) if disk.is_directory() && file.object.is_directory() => {
                disk.perms != file.object.perms
            }
            Some(disk) => !disk.disk_eq(&file.object, ignore_ugids),
        };
        if changed {
            debug!("{}: {} differs from the database", tuple, file.path);
            changes.push(LocalChange {
                path_id: file.path_id,
                path: file.path,
                expected_id: file.file_id,
                expected: file.object,
                found,
            });
        }
    }
    Ok(changes)
}

/// The `A -> A.local` change set of each trove in `tuples`
///
/// Modified files carry their on-disk stream and contents; removed files
/// are dropped from the trove. Troves without local changes are left out.
pub fn local_changeset(
    store: &TroveStore<'_>,
    root: &Path,
    ids: &IdLookup,
    tuples: &[TroveTuple],
    ignore_ugids: bool,
) -> Result<ChangeSet> {
    let mut builder = ChangeSetBuilder::new();
    for tuple in tuples {
        let changes = verify(store, root, ids, tuple, ignore_ugids)?;
        if changes.is_empty() {
            continue;
        }
        let mut trove = store
            .get_trove(tuple, true)?
            .ok_or_else(|| Error::TroveMissing(tuple.to_string()))?;
        for change in changes {
            let Some(obj) = change.found else {
                trove.remove_file(&change.path_id);
                continue;
            };
            let file_id = obj.file_id();
            if let Some(tf) = trove.files.get_mut(&change.path_id) {
                tf.file_id = file_id;
            }
            builder.add_file_stream(&obj);
            if let Some(sha1) = obj.contents_sha1() {
                let data = fs::read(safe_join(root, &change.path)?)?;
                builder.add_regular_contents(change.path_id, file_id, sha1, data);
            }
        }
        trove.sign();
        builder.add_trove_change(TroveChange::relative(tuple, trove));
    }
    Ok(builder.build())
}

/// Put local changes from `cs` back on disk
///
/// Each trove in `cs` must be installed. Files whose id matches the
/// installed one are left alone; files the local trove lacks are removed.
/// Returns the number of paths touched.
pub fn apply_local(
    cs: &ChangeSet,
    store: &TroveStore<'_>,
    root: &Path,
    journal: &mut JobJournal,
    restore: &RestoreContext,
) -> Result<usize> {
    let mut touched = 0;
    for change in cs.trove_changes() {
        let tuple = change.new_tuple();
        let Some(installed) = store.get_trove(&tuple, true)? else {
            warn!("{} is not installed; skipping its local changes", tuple);
            continue;
        };

        for (path_id, tf) in &change.new.files {
            if installed.files.get(path_id).map(|f| f.file_id) == Some(tf.file_id) {
                continue;
            }
            let Some(obj) = cs.get_file(None, tf.file_id)? else {
                warn!("no stream for local change to {}", tf.path);
                continue;
            };
            let mut reader: Option<Box<dyn Read + Send>> = None;
            if obj.is_regular() {
                let Some(entry) = cs.resolve_contents(path_id, &tf.file_id) else {
                    warn!("no contents for local change to {}", tf.path);
                    continue;
                };
                reader = Some(entry.reader()?);
            }
            let target = safe_join(root, &tf.path)?;
            if let Some(dir) = target.parent() {
                journal.mkdir_all(dir)?;
            }
            journal.backup(&target)?;
            obj.restore(&target, reader.as_deref_mut().map(|r| r as &mut dyn Read), restore)?;
            touched += 1;
        }

        for (path_id, tf) in &installed.files {
            if change.new.files.contains_key(path_id) {
                continue;
            }
            let target = safe_join(root, &tf.path)?;
            if fs::symlink_metadata(&target).is_ok() {
                debug!("{} was removed locally; removing it again", tf.path);
                journal.remove(&target)?;
                touched += 1;
            }
        }
    }
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use crate::flavor::Flavor;
    use crate::hash::Sha1Digest;
    use crate::trove::Trove;
    use crate::version::Version;
    use rusqlite::Connection;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Connection, TroveTuple) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/a"), b"alpha").unwrap();
        fs::write(root.join("etc/b"), b"beta").unwrap();
        fs::set_permissions(root.join("etc/a"), fs::Permissions::from_mode(0o644)).unwrap();
        fs::set_permissions(root.join("etc/b"), fs::Permissions::from_mode(0o644)).unwrap();

        let conn = Connection::open_in_memory().unwrap();
        schema::migrate(&conn).unwrap();
        let version = Version::thaw("/repo@ns:1/100.000:1.0-1-1").unwrap();
        let mut trove = Trove::new("foo:runtime", version.clone(), Flavor::empty());
        let mut streams = BTreeMap::new();
        for (path, data) in [("/etc/a", &b"alpha"[..]), ("/etc/b", &b"beta"[..])] {
            let obj = FileObject::regular(data).with_perms(0o644);
            let id = obj.file_id();
            trove.add_file(PathId::for_path(path), path, id, version.clone());
            streams.insert(id, obj);
        }
        let tuple = trove.tuple();
        TroveStore::new(&conn)
            .add_trove(&trove, &streams, &Default::default())
            .unwrap();
        (tmp, conn, tuple)
    }

    #[test]
    fn test_verify_reports_edits_and_removals() {
        let (tmp, conn, tuple) = setup();
        let store = TroveStore::new(&conn);
        let ids = IdLookup::load(tmp.path());
        assert!(verify(&store, tmp.path(), &ids, &tuple, true).unwrap().is_empty());

        fs::write(tmp.path().join("etc/a"), b"edited").unwrap();
        fs::remove_file(tmp.path().join("etc/b")).unwrap();
        let changes = verify(&store, tmp.path(), &ids, &tuple, true).unwrap();
        assert_eq!(changes.len(), 2);
        let edited = changes.iter().find(|c| c.path == "/etc/a").unwrap();
        assert_eq!(
            edited.found.as_ref().and_then(|f| f.contents_sha1()),
            Some(Sha1Digest::of(b"edited"))
        );
        assert!(changes.iter().any(|c| c.path == "/etc/b" && c.is_removed()));
    }

    #[test]
    fn test_local_changeset_round_trip() {
        let (tmp, conn, tuple) = setup();
        let root = tmp.path();
        let store = TroveStore::new(&conn);
        let ids = IdLookup::load(root);

        fs::write(root.join("etc/a"), b"edited").unwrap();
        fs::remove_file(root.join("etc/b")).unwrap();
        let cs = local_changeset(&store, root, &ids, &[tuple.clone()], true).unwrap();
        let change = cs.trove_change(&tuple).unwrap();
        assert_eq!(change.new.files.len(), 1);

        // put the pristine files back, then replay the local changes
        fs::write(root.join("etc/a"), b"alpha").unwrap();
        fs::write(root.join("etc/b"), b"beta").unwrap();
        let journal_path = tmp.path().join("journal");
        let mut journal = JobJournal::start(root, &journal_path).unwrap();
        let restore = RestoreContext::for_root(root, true);
        let touched = apply_local(&cs, &store, root, &mut journal, &restore).unwrap();
        journal.commit().unwrap();

        assert_eq!(touched, 2);
        assert_eq!(fs::read(root.join("etc/a")).unwrap(), b"edited");
        assert!(!root.join("etc/b").exists());
    }
}
