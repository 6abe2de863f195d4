// src/changeset/builder.rs

//! In-process change set construction
//!
//! Used by the engine to write rollbacks and local-changes change sets, and
//! by tests to describe troves compactly.

use super::{ChangeSet, ContentEntry, TroveChange};
use crate::deps::{Dependency, DependencyClass};
use crate::files::FileObject;
use crate::flavor::Flavor;
use crate::hash::{FileId, PathId, Sha1Digest};
use crate::trove::{CapsuleInfo, ScriptKind, Trove, TroveRef, TroveScript, TroveTuple};
use crate::version::Version;
use std::collections::HashMap;

/// Describes one trove and its files
#[derive(Debug, Clone)]
pub struct TroveBuilder {
    trove: Trove,
    files: Vec<(PathId, FileObject, Option<Vec<u8>>)>,
}

impl TroveBuilder {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            trove: Trove::new(name, version, Flavor::empty()),
            files: Vec::new(),
        }
    }

    pub fn flavor(mut self, flavor: Flavor) -> Self {
        self.trove.flavor = flavor;
        self
    }

    /// Add a file whose path id is derived from its path
    pub fn file(self, path: &str, obj: FileObject, contents: &[u8]) -> Self {
        self.file_with_id(PathId::for_path(path), path, obj, Some(contents))
    }

    pub fn file_with_id(
        mut self,
        path_id: PathId,
        path: &str,
        obj: FileObject,
        contents: Option<&[u8]>,
    ) -> Self {
        let version = self.trove.version.clone();
        self.trove.add_file(path_id, path, obj.file_id(), version);
        self.files.push((path_id, obj, contents.map(<[u8]>::to_vec)));
        self
    }

    /// Reference a file the base version already has; no stream or
    /// contents travel with it
    pub fn unchanged(mut self, path: &str, obj: &FileObject) -> Self {
        let version = self.trove.version.clone();
        self.trove.add_file(PathId::for_path(path), path, obj.file_id(), version);
        self
    }

    pub fn provides(mut self, class: DependencyClass, dep: Dependency) -> Self {
        self.trove.provides.add(class, dep);
        self
    }

    pub fn requires(mut self, class: DependencyClass, dep: Dependency) -> Self {
        self.trove.requires.add(class, dep);
        self
    }

    pub fn script(mut self, kind: ScriptKind, script: TroveScript) -> Self {
        self.trove.info.scripts.insert(kind, script);
        self
    }

    pub fn compat_class(mut self, class: u32) -> Self {
        self.trove.info.compat_class = Some(class);
        self
    }

    pub fn include(mut self, tuple: TroveTuple, reference: TroveRef) -> Self {
        self.trove.add_trove(tuple, reference);
        self
    }

    pub fn capsule(mut self, info: CapsuleInfo) -> Self {
        self.trove.info.capsule = Some(info);
        self
    }

    pub fn tuple(&self) -> TroveTuple {
        self.trove.tuple()
    }

    /// The finished trove: provides itself, path hashes and digest filled in
    pub fn finish(mut self) -> (Trove, Vec<(PathId, FileObject, Option<Vec<u8>>)>) {
        let name = self.trove.name.clone();
        self.trove
            .provides
            .add(DependencyClass::Trove, Dependency::new(name));
        self.trove.compute_path_hashes();
        self.trove.sign();
        (self.trove, self.files)
    }
}

/// Accumulates troves, streams and contents into a [`ChangeSet`]
#[derive(Debug, Default)]
pub struct ChangeSetBuilder {
    cs: ChangeSet,
    by_sha1: HashMap<Sha1Digest, (PathId, FileId)>,
}

impl ChangeSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an absolute trove with its files
    pub fn add(&mut self, trove: TroveBuilder) -> TroveTuple {
        let (trove, files) = trove.finish();
        self.add_files(&files);
        let tuple = trove.tuple();
        self.cs.add_trove_change(TroveChange::absolute(trove));
        tuple
    }

    /// Add a trove as a change from `old`
    pub fn add_relative(&mut self, old: &TroveTuple, trove: TroveBuilder) -> TroveTuple {
        let (trove, files) = trove.finish();
        self.add_files(&files);
        let tuple = trove.tuple();
        self.cs.add_trove_change(TroveChange::relative(old, trove));
        tuple
    }

    pub fn erase(&mut self, tuple: TroveTuple) {
        self.cs.add_old_trove(tuple);
    }

    pub fn primary(&mut self, tuple: TroveTuple) {
        self.cs.add_primary(tuple);
    }

    pub fn add_trove_change(&mut self, change: TroveChange) {
        self.cs.add_trove_change(change);
    }

    fn add_files(&mut self, files: &[(PathId, FileObject, Option<Vec<u8>>)]) {
        for (path_id, obj, contents) in files {
            self.add_file_stream(obj);
            let file_id = obj.file_id();
            match (obj.contents_sha1(), contents) {
                (Some(sha1), Some(data)) => {
                    self.add_regular_contents(*path_id, file_id, sha1, data.clone())
                }
                (Some(_), None) => self.add_hldr(*path_id, file_id),
                _ => {}
            }
        }
    }

    /// Ship `obj` as an absolute stream
    pub fn add_file_stream(&mut self, obj: &FileObject) {
        self.cs.add_file_stream(None, obj.file_id(), obj.freeze());
    }

    /// Add full contents, or a pointer when identical contents were added
    pub fn add_regular_contents(&mut self, path_id: PathId, file_id: FileId, sha1: Sha1Digest, data: Vec<u8>) {
        match self.by_sha1.get(&sha1) {
            Some((p, f)) if (*p, *f) != (path_id, file_id) => {
                self.cs.add_contents(path_id, file_id, ContentEntry::ptr(*p, *f));
            }
            _ => {
                self.by_sha1.insert(sha1, (path_id, file_id));
                self.cs.add_contents(path_id, file_id, ContentEntry::regular(data));
            }
        }
    }

    pub fn add_diff_contents(&mut self, path_id: PathId, file_id: FileId, diff: Vec<u8>) {
        self.cs.add_contents(path_id, file_id, ContentEntry::diff(diff));
    }

    pub fn add_hldr(&mut self, path_id: PathId, file_id: FileId) {
        self.cs.add_contents(path_id, file_id, ContentEntry::hldr());
    }

    pub fn build(self) -> ChangeSet {
        self.cs
    }
}
