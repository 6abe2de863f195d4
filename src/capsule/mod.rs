// src/capsule/mod.rs

//! Capsules: troves whose files are installed by a foreign packager
//!
//! A capsule trove carries the foreign package itself as a payload at
//! [`PathId::CAPSULE`]. During an apply the engine hands capsule installs
//! and erases to the plugin for the trove's packager kind; the plugin runs
//! one foreign transaction per apply.
//!
//! Packages the foreign database knows about but Conary does not are
//! recorded as phantom troves on `/local@local:PHANTOM`.

pub mod cpio;
pub mod foreign;
pub mod header;
pub mod payload;
pub mod rpm;

pub use foreign::{ForeignDb, ForeignOptions, InstalledPackage, MemoryRpmDb, RpmCommandDb};
pub use self::rpm::{Nevra, RpmCapsule, RpmPackage};

use crate::changeset::ChangeSetBuilder;
use crate::db::TroveStore;
use crate::error::Result;
use crate::hash::{FileId, Sha1Digest};
use crate::progress::UpdateCallback;
use crate::trove::{CapsuleInfo, Trove, TroveTuple};
use std::fmt;
use std::path::Path;
use tracing::debug;

/// A packager the engine can delegate capsule troves to
pub trait CapsulePlugin {
    /// Packager kind, matched against [`CapsuleInfo::kind`]
    fn kind(&self) -> &str;

    /// Whether the packager is usable for `root`
    fn check(&self, root: &Path) -> bool;

    /// Capsule troves in the local database, keyed by package identity
    fn get_capsule_keys_from_local(&self, store: &TroveStore<'_>) -> Result<Vec<(PartialTuple, TroveTuple)>>;

    /// Packages the foreign database has installed
    fn get_capsule_keys_from_target(&self) -> Result<Vec<PartialTuple>>;

    /// Add a phantom trove for the installed package `key` to `builder`
    fn add_phantom_trove(
        &self,
        builder: &mut ChangeSetBuilder,
        root: &Path,
        key: &PartialTuple,
        callback: &dyn UpdateCallback,
        n: usize,
        total: usize,
    ) -> Result<TroveTuple>;

    /// Stage `payload` for installation
    fn install(&mut self, trove: &Trove, payload: Vec<u8>) -> Result<()>;

    /// Stage the package behind `trove` for removal
    fn remove(&mut self, trove: &Trove) -> Result<()>;

    /// Run the staged work as one foreign transaction
    fn apply(&mut self, root: &Path, opts: &ForeignOptions) -> Result<()>;
}

/// Package identity with every field optional
///
/// Two tuples match when every field both sides carry agrees; a missing
/// field matches anything.
#[derive(Debug, Clone, Default)]
pub struct PartialTuple {
    pub name: Option<String>,
    pub epoch: Option<u32>,
    pub version: Option<String>,
    pub release: Option<String>,
    pub arch: Option<String>,
    pub digest: Option<Sha1Digest>,
}

fn agree<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

impl PartialTuple {
    /// An absent epoch is recorded as zero
    pub fn from_capsule(info: &CapsuleInfo) -> Self {
        Self {
            name: Some(info.name.clone()),
            epoch: Some(info.epoch.unwrap_or(0)),
            version: Some(info.version.clone()),
            release: Some(info.release.clone()),
            arch: Some(info.arch.clone()),
            digest: info.header_sha1,
        }
    }

    pub fn from_nevra(nevra: &Nevra, digest: Option<Sha1Digest>) -> Self {
        Self {
            name: Some(nevra.name.clone()),
            epoch: Some(nevra.epoch.unwrap_or(0)),
            version: Some(nevra.version.clone()),
            release: Some(nevra.release.clone()),
            arch: Some(nevra.arch.clone()),
            digest,
        }
    }

    pub fn matches(&self, other: &PartialTuple) -> bool {
        agree(&self.name, &other.name)
            && agree(&self.epoch, &other.epoch)
            && agree(&self.version, &other.version)
            && agree(&self.release, &other.release)
            && agree(&self.arch, &other.arch)
            && agree(&self.digest, &other.digest)
    }
}

impl PartialEq for PartialTuple {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

impl fmt::Display for PartialTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = |v: &Option<String>| v.clone().unwrap_or_else(|| "*".to_string());
        write!(f, "{}-", s(&self.name))?;
        if let Some(e) = self.epoch {
            write!(f, "{}:", e)?;
        }
        write!(f, "{}-{}.{}", s(&self.version), s(&self.release), s(&self.arch))
    }
}

/// File id the capsule payload is stored under
///
/// The header digest when known, otherwise the digest of the package
/// identity.
pub fn capsule_file_id(info: &CapsuleInfo) -> FileId {
    info.header_sha1.unwrap_or_else(|| {
        Sha1Digest::of(
            format!(
                "{}:{}-{}:{}-{}.{}",
                info.kind,
                info.name,
                info.epoch.unwrap_or(0),
                info.version,
                info.release,
                info.arch
            )
            .as_bytes(),
        )
    })
}

/// The capsule plugins available to an engine
#[derive(Default)]
pub struct CapsuleManager {
    plugins: Vec<Box<dyn CapsulePlugin>>,
}

impl CapsuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The plugins usable on `root`: rpm when the root has an rpm database
    pub fn for_root(root: &Path) -> Self {
        let mut manager = Self::new();
        let rpm = RpmCapsule::new(Box::new(RpmCommandDb::new(root)));
        if rpm.check(root) {
            manager.add(Box::new(rpm));
        } else {
            debug!("no rpm database under {}", root.display());
        }
        manager
    }

    /// Register `plugin`, replacing any plugin of the same kind
    pub fn add(&mut self, plugin: Box<dyn CapsulePlugin>) {
        self.plugins.retain(|p| p.kind() != plugin.kind());
        self.plugins.push(plugin);
    }

    pub fn get_mut(&mut self, kind: &str) -> Option<&mut Box<dyn CapsulePlugin>> {
        self.plugins.iter_mut().find(|p| p.kind() == kind)
    }

    pub fn plugins(&self) -> impl Iterator<Item = &dyn CapsulePlugin> {
        self.plugins.iter().map(|p| p.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> CapsuleInfo {
        CapsuleInfo {
            kind: "rpm".to_string(),
            name: "foo".to_string(),
            epoch: None,
            version: "1.0".to_string(),
            release: "1".to_string(),
            arch: "x86_64".to_string(),
            header_sha1: None,
        }
    }

    #[test]
    fn test_partial_match() {
        let local = PartialTuple::from_capsule(&info());
        assert_eq!(local.epoch, Some(0));

        let nevra = Nevra::from_capsule(&info());
        let digest = Sha1Digest::of(b"header");
        let target = PartialTuple::from_nevra(&nevra, Some(digest));
        assert_eq!(local, target);

        let mut other = info();
        other.header_sha1 = Some(Sha1Digest::of(b"other"));
        assert_ne!(PartialTuple::from_capsule(&other), target);

        let by_name = PartialTuple {
            name: Some("foo".to_string()),
            ..Default::default()
        };
        assert!(by_name.matches(&target));
        assert_eq!(by_name.to_string(), "foo-*-*.*");
        assert_eq!(target.to_string(), "foo-0:1.0-1.x86_64");
    }

    #[test]
    fn test_capsule_file_id() {
        let mut i = info();
        let fallback = capsule_file_id(&i);
        assert_eq!(fallback, capsule_file_id(&i));
        i.header_sha1 = Some(Sha1Digest::of(b"h"));
        assert_eq!(capsule_file_id(&i), Sha1Digest::of(b"h"));
        assert_ne!(capsule_file_id(&i), fallback);
    }

    #[test]
    fn test_manager_replaces_kind() {
        let mut manager = CapsuleManager::new();
        assert!(manager.is_empty());
        manager.add(Box::new(RpmCapsule::new(Box::new(MemoryRpmDb::new()))));
        manager.add(Box::new(RpmCapsule::new(Box::new(MemoryRpmDb::new()))));
        assert_eq!(manager.plugins().count(), 1);
        assert!(manager.get_mut("rpm").is_some());
        assert!(manager.get_mut("deb").is_none());
    }
}
