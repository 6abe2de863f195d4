// src/update/conflicts.rs

//! Merge errors and the policy for two troves claiming one path

use crate::filesystem::path::is_under;
use crate::hash::FileId;
use crate::label::LabelPath;
use crate::trove::TroveTuple;
use thiserror::Error;

/// Documentation paths that several packages may legitimately ship
pub const SHARED_DOC_DIR: &str = "/usr/share/doc";

/// A per-file problem found while planning a filesystem job
///
/// Planning collects these and keeps going; an apply with any of them is
/// refused before the filesystem is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("{path} was renamed locally and in the repository (to {head_path})")]
    PathConflict { path: String, head_path: String },

    #[error("{path} is in the way of a newly created file in {trove}")]
    FileInWay { path: String, trove: String },

    #[error("non-empty directory {path} is in the way of a newly created file in {trove}")]
    DirectoryInWay { path: String, trove: String },

    #[error("{path} conflicts with a file owned by {owner} (installing {trove})")]
    DatabasePathConflict {
        path: String,
        trove: String,
        owner: String,
    },

    #[error("file type of {path} changed")]
    FileTypeChanged { path: String },

    #[error("{path} changed from a directory to a non-directory; move {path} out of the way manually, then rerun")]
    DirectoryToNonDirectory { path: String },

    #[error("{path} changed from a directory to a symbolic link to {target}; move the contents of {path} to {target} manually, then rerun")]
    DirectoryToSymLink { path: String, target: String },

    #[error("file attributes conflict for {path}")]
    FileAttributesConflict { path: String },

    #[error("file contents conflict for {path}")]
    FileContentsConflict { path: String },

    #[error("{path} is listed more than once in {trove}")]
    DuplicatePath { path: String, trove: String },
}

impl MergeError {
    pub fn path(&self) -> &str {
        match self {
            MergeError::PathConflict { path, .. }
            | MergeError::FileInWay { path, .. }
            | MergeError::DirectoryInWay { path, .. }
            | MergeError::DatabasePathConflict { path, .. }
            | MergeError::FileTypeChanged { path }
            | MergeError::DirectoryToNonDirectory { path }
            | MergeError::DirectoryToSymLink { path, .. }
            | MergeError::FileAttributesConflict { path }
            | MergeError::FileContentsConflict { path }
            | MergeError::DuplicatePath { path, .. } => path,
        }
    }
}

/// One trove's claim on a path within a job
#[derive(Debug, Clone)]
pub struct Claim<'a> {
    pub owner: &'a TroveTuple,
    pub file_id: FileId,
    /// Contents are managed by a foreign packager
    pub encapsulated: bool,
    /// ELF class of the contents, when known
    pub elf_class: Option<u8>,
}

/// What to do when a second trove in the same job restores a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Identical file; both troves own it
    Share,
    /// Keep the first claim on disk; the newcomer is recorded as an owner
    ShareExisting,
    /// Keep the first claim; the newcomer does not own the path
    KeepExisting,
    /// The newcomer replaces the first claim, which loses ownership
    TakeNew,
    Conflict,
}

/// Decide between two claims on `path`
pub fn resolve_duplicate(
    path: &str,
    existing: &Claim<'_>,
    incoming: &Claim<'_>,
    label_path: &LabelPath,
    replace_managed: bool,
) -> Resolution {
    if existing.file_id == incoming.file_id {
        return Resolution::Share;
    }

    // multilib capsules: the 64-bit build of a binary wins
    if existing.encapsulated
        && incoming.encapsulated
        && let (Some(old_class), Some(new_class)) = (existing.elf_class, incoming.elf_class)
        && old_class != new_class
    {
        return if new_class > old_class {
            Resolution::TakeNew
        } else {
            Resolution::KeepExisting
        };
    }

    if is_under(path, SHARED_DOC_DIR) {
        return Resolution::ShareExisting;
    }

    let old_label = existing.owner.version.trailing_label();
    let new_label = incoming.owner.version.trailing_label();
    if label_path.outranks(new_label, old_label) {
        return Resolution::TakeNew;
    }
    if label_path.outranks(old_label, new_label) {
        return Resolution::KeepExisting;
    }

    if replace_managed {
        Resolution::TakeNew
    } else {
        Resolution::Conflict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::Flavor;
    use crate::hash::Sha1Digest;
    use crate::label::Label;
    use crate::version::Version;

    fn tuple(name: &str, version: &str) -> TroveTuple {
        TroveTuple::new(name, Version::parse(version).unwrap(), Flavor::empty())
    }

    fn claim(owner: &TroveTuple, id: u8) -> Claim<'_> {
        Claim {
            owner,
            file_id: Sha1Digest([id; 20]),
            encapsulated: false,
            elf_class: None,
        }
    }

    #[test]
    fn test_same_file_is_shared() {
        let a = tuple("a:runtime", "/conary.example.com@rpl:1/1.0-1-1");
        let b = tuple("b:runtime", "/conary.example.com@rpl:1/1.0-1-1");
        let res = resolve_duplicate("/shared", &claim(&a, 1), &claim(&b, 1), &LabelPath::new(), false);
        assert_eq!(res, Resolution::Share);
    }

    #[test]
    fn test_different_files_conflict() {
        let a = tuple("a:runtime", "/conary.example.com@rpl:1/1.0-1-1");
        let b = tuple("b:runtime", "/conary.example.com@rpl:1/1.0-1-1");
        let res = resolve_duplicate("/etc/x", &claim(&a, 1), &claim(&b, 2), &LabelPath::new(), false);
        assert_eq!(res, Resolution::Conflict);
        let res = resolve_duplicate("/etc/x", &claim(&a, 1), &claim(&b, 2), &LabelPath::new(), true);
        assert_eq!(res, Resolution::TakeNew);
    }

    #[test]
    fn test_doc_dir_allowed() {
        let a = tuple("a:doc", "/conary.example.com@rpl:1/1.0-1-1");
        let b = tuple("b:doc", "/conary.example.com@rpl:1/1.0-1-1");
        let res = resolve_duplicate(
            "/usr/share/doc/README",
            &claim(&a, 1),
            &claim(&b, 2),
            &LabelPath::new(),
            false,
        );
        assert_eq!(res, Resolution::ShareExisting);
    }

    #[test]
    fn test_sixty_four_bit_wins() {
        let a = tuple("lib32:rpm", "/conary.example.com@rpl:1/1.0-1-1");
        let b = tuple("lib64:rpm", "/conary.example.com@rpl:1/1.0-1-1");
        let mut old = claim(&a, 1);
        old.encapsulated = true;
        old.elf_class = Some(32);
        let mut new = claim(&b, 2);
        new.encapsulated = true;
        new.elf_class = Some(64);
        assert_eq!(
            resolve_duplicate("/usr/bin/tool", &old, &new, &LabelPath::new(), false),
            Resolution::TakeNew
        );
        assert_eq!(
            resolve_duplicate("/usr/bin/tool", &new, &old, &LabelPath::new(), false),
            Resolution::KeepExisting
        );
    }

    #[test]
    fn test_label_priority() {
        let a = tuple("a:runtime", "/low.example.com@rpl:1/1.0-1-1");
        let b = tuple("b:runtime", "/high.example.com@rpl:1/1.0-1-1");
        let path = LabelPath::from_labels(vec![
            Label::parse("high.example.com@rpl:1").unwrap(),
            Label::parse("low.example.com@rpl:1").unwrap(),
        ]);
        assert_eq!(
            resolve_duplicate("/etc/x", &claim(&a, 1), &claim(&b, 2), &path, false),
            Resolution::TakeNew
        );
        assert_eq!(
            resolve_duplicate("/etc/x", &claim(&b, 2), &claim(&a, 1), &path, false),
            Resolution::KeepExisting
        );
    }

    #[test]
    fn test_error_path() {
        let err = MergeError::DirectoryToNonDirectory {
            path: "/var/x".to_string(),
        };
        assert_eq!(err.path(), "/var/x");
        assert!(err.to_string().contains("manually"));
    }
}
