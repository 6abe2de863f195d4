// src/config.rs

//! Engine configuration and per-operation update flags

use crate::error::{Error, Result};
use crate::label::LabelPath;
use serde::{Deserialize, Serialize};
use std::fs;
use std::ops::BitOr;
use std::path::{Path, PathBuf};

/// Default database directory, relative to the install root
pub const DEFAULT_DB_PATH: &str = "/var/lib/conarydb";

/// Default tag description directory, relative to the install root
pub const DEFAULT_TAG_DIR: &str = "/etc/conary/tags";

/// Settings for one engine instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Install root
    pub root: PathBuf,
    /// Database directory, relative to `root`
    pub db_path: String,
    /// Tag description directory, relative to `root`
    pub tag_handler_dir: String,
    /// File priority path; earlier labels win path collisions silently
    pub label_priority: Vec<String>,
    /// Replace files owned by other troves
    pub replace_managed_files: bool,
    /// Replace files no trove owns
    pub replace_unmanaged_files: bool,
    /// Replace locally modified non-config files
    pub replace_modified_files: bool,
    /// Run every pre-script before any content changes
    pub legacy_prescripts: bool,
    /// Write tag handler invocations to this script instead of running them
    pub tag_script: Option<PathBuf>,
    /// Seconds to wait for the root lock
    pub lock_timeout_secs: u64,
    /// Treat owner and group differences as equal
    pub ignore_ugids: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            db_path: DEFAULT_DB_PATH.to_string(),
            tag_handler_dir: DEFAULT_TAG_DIR.to_string(),
            label_priority: Vec::new(),
            replace_managed_files: false,
            replace_unmanaged_files: false,
            replace_modified_files: false,
            legacy_prescripts: false,
            tag_script: None,
            lock_timeout_secs: 5,
            ignore_ugids: false,
        }
    }
}

impl EngineConfig {
    /// Defaults for an install root
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("{}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.label_path()?;
        Ok(config)
    }

    /// The database directory on the host
    pub fn db_dir(&self) -> PathBuf {
        self.root.join(self.db_path.trim_start_matches('/'))
    }

    pub fn tag_dir(&self) -> PathBuf {
        self.root.join(self.tag_handler_dir.trim_start_matches('/'))
    }

    pub fn label_path(&self) -> Result<LabelPath> {
        Ok(LabelPath::parse(&self.label_priority.join(" "))?)
    }

    /// Update flags implied by the replace and ugid settings
    pub fn default_flags(&self) -> UpdateFlags {
        let mut flags = UpdateFlags::empty();
        if self.replace_managed_files {
            flags = flags | UpdateFlags::REPLACE_MANAGED_FILES;
        }
        if self.replace_unmanaged_files {
            flags = flags | UpdateFlags::REPLACE_UNMANAGED_FILES;
        }
        if self.replace_modified_files {
            flags = flags | UpdateFlags::REPLACE_MODIFIED_FILES;
        }
        if self.ignore_ugids {
            flags = flags | UpdateFlags::IGNORE_UGIDS;
        }
        flags
    }
}

/// Behavior switches for one apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UpdateFlags(u32);

impl UpdateFlags {
    /// Merge local changes; without it the new version replaces the old
    pub const MERGE: UpdateFlags = UpdateFlags(1 << 0);
    pub const REPLACE_MANAGED_FILES: UpdateFlags = UpdateFlags(1 << 1);
    pub const REPLACE_UNMANAGED_FILES: UpdateFlags = UpdateFlags(1 << 2);
    pub const REPLACE_MODIFIED_FILES: UpdateFlags = UpdateFlags(1 << 3);
    pub const IGNORE_UGIDS: UpdateFlags = UpdateFlags(1 << 4);
    /// Files missing from disk are not errors (used by rollbacks)
    pub const MISSING_FILES_OKAY: UpdateFlags = UpdateFlags(1 << 5);
    pub const IGNORE_INITIAL_CONTENTS: UpdateFlags = UpdateFlags(1 << 6);
    /// Update the database without touching the filesystem
    pub const JUST_DATABASE: UpdateFlags = UpdateFlags(1 << 7);
    pub const NO_SCRIPTS: UpdateFlags = UpdateFlags(1 << 8);
    /// Plan only
    pub const TEST: UpdateFlags = UpdateFlags(1 << 9);

    pub const fn empty() -> Self {
        UpdateFlags(0)
    }

    pub const fn contains(&self, other: UpdateFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: UpdateFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: UpdateFlags) {
        self.0 &= !other.0;
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Unknown bits are dropped
    pub const fn from_bits(bits: u32) -> Self {
        UpdateFlags(bits & ((1 << 10) - 1))
    }
}

impl BitOr for UpdateFlags {
    type Output = UpdateFlags;

    fn bitor(self, rhs: Self) -> Self {
        UpdateFlags(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_are_root_relative() {
        let config = EngineConfig::for_root("/mnt/sysroot");
        assert_eq!(config.db_dir(), PathBuf::from("/mnt/sysroot/var/lib/conarydb"));
        assert_eq!(config.tag_dir(), PathBuf::from("/mnt/sysroot/etc/conary/tags"));
    }

    #[test]
    fn test_load_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(
            &path,
            "root = \"/tmp/root\"\nlabel_priority = [\"a@ns:1\", \"b@ns:1\"]\nreplace_unmanaged_files = true\n",
        )
        .unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.root, PathBuf::from("/tmp/root"));
        assert_eq!(config.label_path().unwrap().len(), 2);
        assert_eq!(config.lock_timeout_secs, 5);
        assert!(config.default_flags().contains(UpdateFlags::REPLACE_UNMANAGED_FILES));
        assert!(!config.default_flags().contains(UpdateFlags::REPLACE_MANAGED_FILES));
    }

    #[test]
    fn test_bad_label_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(&path, "label_priority = [\"nolabel\"]\n").unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }

    #[test]
    fn test_flag_ops() {
        let mut flags = UpdateFlags::MERGE | UpdateFlags::TEST;
        assert!(flags.contains(UpdateFlags::MERGE));
        flags.remove(UpdateFlags::TEST);
        assert!(!flags.contains(UpdateFlags::TEST));
        flags.insert(UpdateFlags::NO_SCRIPTS);
        assert!(flags.contains(UpdateFlags::MERGE | UpdateFlags::NO_SCRIPTS));
    }
}
