// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use conary_engine::changeset::{ChangeSet, ChangeSetBuilder, TroveBuilder};
use conary_engine::config::{EngineConfig, UpdateFlags};
use conary_engine::engine::{ApplyOptions, ApplyReport, Engine};
use conary_engine::files::{FileFlags, FileObject};
use conary_engine::progress::SilentCallback;
use conary_engine::version::Version;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// An install root in a temporary directory
///
/// Scripts are written to a tag script instead of being run, so tests see
/// the calls without needing a shell inside the root.
pub struct TestRoot {
    _tmp: TempDir,
    pub root: PathBuf,
    pub tag_script: PathBuf,
}

impl TestRoot {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let tag_script = tmp.path().join("tag-script");
        Self {
            _tmp: tmp,
            root,
            tag_script,
        }
    }

    pub fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::for_root(&self.root);
        config.ignore_ugids = true;
        config.tag_script = Some(self.tag_script.clone());
        config
    }

    pub fn engine(&self) -> Engine {
        Engine::open(self.config()).unwrap()
    }

    pub fn path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    pub fn read(&self, path: &str) -> String {
        fs::read_to_string(self.path(path)).unwrap()
    }

    /// Replace `path` with a new inode holding `contents`
    pub fn write(&self, path: &str, contents: &str) {
        let target = self.path(path);
        let dir = target.parent().unwrap();
        fs::create_dir_all(dir).unwrap();
        let perms = fs::metadata(&target)
            .map(|m| m.permissions())
            .unwrap_or_else(|_| fs::Permissions::from_mode(0o644));
        let tmp = tempfile::NamedTempFile::new_in(dir).unwrap();
        fs::write(tmp.path(), contents).unwrap();
        fs::set_permissions(tmp.path(), perms).unwrap();
        tmp.persist(&target).unwrap();
    }

    pub fn exists(&self, path: &str) -> bool {
        fs::symlink_metadata(self.path(path)).is_ok()
    }

    /// Every file and directory under the root, leaving out the database
    /// and script scratch space
    ///
    /// Directories are keyed with a trailing `/` and map to no contents.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        let mut out = BTreeMap::new();
        for entry in walkdir::WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.unwrap();
            let rel = entry.path().strip_prefix(&self.root).unwrap().to_string_lossy().into_owned();
            if rel.starts_with("var") || rel.starts_with("tmp") {
                continue;
            }
            if entry.file_type().is_dir() {
                out.insert(format!("{rel}/"), Vec::new());
            } else {
                out.insert(rel, fs::read(entry.path()).unwrap_or_default());
            }
        }
        out
    }
}

/// A version on the test label; later versions sort after earlier ones
pub fn v(version: &str) -> Version {
    let stamp: u64 = version.chars().filter(char::is_ascii_digit).collect::<String>().parse().unwrap();
    Version::thaw(&format!("/repo@ns:1/{}.000:{}-1-1", stamp * 100, version)).unwrap()
}

pub fn regular(contents: &str) -> FileObject {
    FileObject::regular(contents.as_bytes()).with_perms(0o644)
}

pub fn config_file(contents: &str) -> FileObject {
    regular(contents).with_flag(FileFlags::CONFIG)
}

/// A trove with regular files given as (path, contents)
pub fn trove(name: &str, version: &str, files: &[(&str, &str)]) -> TroveBuilder {
    files.iter().fold(TroveBuilder::new(name, v(version)), |tb, (path, contents)| {
        tb.file(path, regular(contents), contents.as_bytes())
    })
}

pub fn install_cs(troves: Vec<TroveBuilder>) -> ChangeSet {
    let mut builder = ChangeSetBuilder::new();
    for tb in troves {
        let tuple = builder.add(tb);
        builder.primary(tuple);
    }
    builder.build()
}

pub fn apply(engine: &mut Engine, cs: &ChangeSet) -> ApplyReport {
    engine
        .apply(cs, &merge_opts(), &SilentCallback)
        .unwrap()
}

pub fn merge_opts() -> ApplyOptions {
    ApplyOptions {
        flags: UpdateFlags::MERGE,
        ..Default::default()
    }
}

pub fn is_installed(engine: &Engine, name: &str) -> bool {
    engine.store().all_troves().unwrap().iter().any(|t| t.name == name)
}

pub fn db_dir(root: &Path) -> PathBuf {
    EngineConfig::for_root(root).db_dir()
}
