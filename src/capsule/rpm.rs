// src/capsule/rpm.rs

//! RPM packages as capsules
//!
//! [`RpmPackage`] reads a binary package held in memory. [`RpmCapsule`] is
//! the capsule plugin: it stages package installs and erases during an
//! apply and hands them to a [`ForeignDb`] in one foreign transaction.

use super::cpio::CpioReader;
use super::foreign::{ForeignDb, ForeignOptions, InstalledPackage, StagedPackage};
use super::header::{self, PackageHeaders};
use super::payload;
use super::{CapsulePlugin, PartialTuple};
use crate::changeset::{ChangeSetBuilder, TroveBuilder};
use crate::db::TroveStore;
use crate::error::{Error, Result};
use crate::files::{FileFlags, FileKind, FileObject, IdLookup};
use crate::flavor::Flavor;
use crate::hash::{PathId, Sha1Digest};
use crate::progress::UpdateCallback;
use crate::trove::{info_type, CapsuleInfo, Trove, TroveInfo, TroveTuple};
use crate::version::{Branch, Revision, Version};
use rpm::IndexTag;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const KIND: &str = "rpm";

/// Label phantom troves are placed on
pub const PHANTOM_BRANCH: &str = "/local@local:PHANTOM";

/// `FILEFLAGS` bits
pub mod file_flag {
    pub const CONFIG: u32 = 1 << 0;
    pub const DOC: u32 = 1 << 1;
    pub const MISSINGOK: u32 = 1 << 3;
    pub const NOREPLACE: u32 = 1 << 4;
    pub const GHOST: u32 = 1 << 6;
}

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;
const S_IFBLK: u32 = 0o060000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

/// Name, epoch, version, release and architecture of a package
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nevra {
    pub name: String,
    pub epoch: Option<u32>,
    pub version: String,
    pub release: String,
    pub arch: String,
}

impl Nevra {
    /// `name-version-release.arch`, the spelling the rpm tool accepts
    pub fn nvra(&self) -> String {
        format!("{}-{}-{}.{}", self.name, self.version, self.release, self.arch)
    }

    pub fn from_capsule(info: &CapsuleInfo) -> Self {
        Self {
            name: info.name.clone(),
            epoch: info.epoch,
            version: info.version.clone(),
            release: info.release.clone(),
            arch: info.arch.clone(),
        }
    }
}

impl fmt::Display for Nevra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.epoch {
            Some(e) => write!(f, "{}-{}:{}-{}.{}", self.name, e, self.version, self.release, self.arch),
            None => f.write_str(&self.nvra()),
        }
    }
}

/// One file as the package header describes it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpmFile {
    pub path: String,
    pub mode: u32,
    pub size: u64,
    pub mtime: u32,
    pub rdev: u32,
    pub user: String,
    pub group: String,
    pub link_to: String,
    pub flags: u32,
}

impl RpmFile {
    pub fn is_config(&self) -> bool {
        self.flags & file_flag::CONFIG != 0
    }

    pub fn is_ghost(&self) -> bool {
        self.flags & file_flag::GHOST != 0
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// A file object for this entry; regular files take their digest from
    /// `contents`
    pub fn object(&self, contents: Option<&[u8]>) -> Option<FileObject> {
        let obj = match self.mode & S_IFMT {
            S_IFREG => {
                let mut obj = FileObject::regular(b"");
                if let Some(data) = contents {
                    obj.set_contents(data);
                }
                obj
            }
            S_IFDIR => FileObject::directory(),
            S_IFLNK => FileObject::symlink(self.link_to.clone()),
            S_IFBLK | S_IFCHR => FileObject::device(
                self.mode & S_IFMT == S_IFBLK,
                (self.rdev >> 8) & 0xfff,
                (self.rdev & 0xff) | ((self.rdev >> 12) & 0xfff00),
            ),
            S_IFIFO => FileObject::fifo(),
            _ => return None,
        };
        let perms = if obj.is_symlink() { 0o777 } else { (self.mode & 0o7777) as u16 };
        let mut obj = obj
            .with_perms(perms)
            .with_owner(&self.user, &self.group)
            .with_mtime(self.mtime);
        if self.is_config() {
            obj.flags.set(FileFlags::CONFIG, true);
        }
        Some(obj)
    }
}

/// File entries listed by a package header
pub fn header_files(headers: &PackageHeaders) -> Vec<RpmFile> {
    let Ok(entries) = headers.package.metadata.get_file_entries() else {
        return Vec::new();
    };
    let mtimes = headers.u32s(IndexTag::RPMTAG_FILEMTIMES);
    let rdevs = headers.u16s(IndexTag::RPMTAG_FILERDEVS);
    let owner = |name: &str| {
        if name.is_empty() {
            "root".to_string()
        } else {
            name.to_string()
        }
    };

    entries
        .into_iter()
        .enumerate()
        .map(|(n, entry)| RpmFile {
            path: entry.path.to_string_lossy().into_owned(),
            mode: entry.mode.raw_mode() as u32,
            size: entry.size as u64,
            mtime: mtimes.get(n).copied().unwrap_or(0),
            rdev: rdevs.get(n).copied().unwrap_or(0),
            user: owner(&entry.ownership.user),
            group: owner(&entry.ownership.group),
            link_to: entry.linkto.clone(),
            flags: entry.flags.bits(),
        })
        .collect()
}

pub fn header_nevra(headers: &PackageHeaders) -> Result<Nevra> {
    let meta = &headers.package.metadata;
    let field = |value: std::result::Result<&str, rpm::Error>, what: &str| {
        value
            .map(str::to_string)
            .map_err(|e| Error::IncompleteHeader(format!("package has no {}: {}", what, e)))
    };
    Ok(Nevra {
        name: field(meta.get_name(), "name")?,
        // an explicit zero epoch spells the same as none
        epoch: meta.get_epoch().ok().filter(|e| *e != 0),
        version: field(meta.get_version(), "version")?,
        release: field(meta.get_release(), "release")?,
        arch: meta.get_arch().unwrap_or("noarch").to_string(),
    })
}

/// A binary package file
#[derive(Debug, Clone)]
pub struct RpmPackage {
    pub nevra: Nevra,
    pub header_sha1: Sha1Digest,
    pub files: Vec<RpmFile>,
    payload_format: Option<String>,
    payload_compressor: Option<String>,
    payload_offset: usize,
    data: Vec<u8>,
}

impl RpmPackage {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let headers = header::read_package(&data)?;
        let nevra = header_nevra(&headers)?;
        let files = header_files(&headers);
        debug!("parsed {} ({} files)", nevra, files.len());
        Ok(Self {
            nevra,
            header_sha1: headers.header_sha1,
            files,
            payload_format: headers.string(IndexTag::RPMTAG_PAYLOADFORMAT).map(str::to_string),
            payload_compressor: headers.string(IndexTag::RPMTAG_PAYLOADCOMPRESSOR).map(str::to_string),
            payload_offset: headers.payload_offset,
            data,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        Self::parse(fs::read(path)?)
    }

    /// The whole package file
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn capsule_info(&self) -> CapsuleInfo {
        CapsuleInfo {
            kind: KIND.to_string(),
            name: self.nevra.name.clone(),
            epoch: self.nevra.epoch,
            version: self.nevra.version.clone(),
            release: self.nevra.release.clone(),
            arch: self.nevra.arch.clone(),
            header_sha1: Some(self.header_sha1),
        }
    }

    /// Every payload member keyed by absolute path
    pub fn payload(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        let format = self.payload_format.as_deref().unwrap_or("cpio");
        if format != "cpio" {
            return Err(Error::CapsuleError(format!(
                "{}: unsupported payload format {}",
                self.nevra, format
            )));
        }
        let raw = &self.data[self.payload_offset..];
        let mut reader = CpioReader::new(payload::payload_decoder(raw, self.payload_compressor.as_deref())?);
        let mut out = BTreeMap::new();
        while let Some((entry, data)) = reader.next_entry()? {
            out.insert(entry.path(), data);
        }
        Ok(out)
    }

    /// Write the payload under `root`, skipping ghosts
    pub fn extract(&self, root: &Path) -> Result<()> {
        let payload = self.payload()?;
        for file in self.files.iter().filter(|f| !f.is_ghost()) {
            let target = root.join(file.path.trim_start_matches('/'));
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            match file.mode & S_IFMT {
                S_IFDIR => fs::create_dir_all(&target)?,
                S_IFLNK => {
                    if target.symlink_metadata().is_ok() {
                        fs::remove_file(&target)?;
                    }
                    std::os::unix::fs::symlink(&file.link_to, &target)?;
                }
                S_IFREG => {
                    let data = payload.get(&file.path).map(Vec::as_slice).unwrap_or_default();
                    fs::write(&target, data)?;
                    fs::set_permissions(&target, fs::Permissions::from_mode(file.mode & 0o7777))?;
                }
                _ => debug!("{}: not extracting special file {}", self.nevra, file.path),
            }
        }
        Ok(())
    }
}

/// Add `pkg` to `builder` as a capsule trove named `name`
///
/// Configuration files are left to Conary, with contents captured from the
/// filesystem once the foreign packager has written them. Everything else
/// is marked as encapsulated content. The package itself travels as the
/// capsule payload.
pub fn encapsulate(builder: &mut ChangeSetBuilder, pkg: &RpmPackage, name: &str, version: Version) -> Result<TroveTuple> {
    let payload = pkg.payload()?;
    let info = pkg.capsule_info();
    let mut tb = TroveBuilder::new(name, version)
        .flavor(arch_flavor(&pkg.nevra.arch))
        .capsule(info.clone());
    for file in &pkg.files {
        let contents = payload.get(&file.path).map(Vec::as_slice);
        let Some(mut obj) = file.object(contents) else {
            continue;
        };
        if !file.is_config() {
            obj.flags.set(FileFlags::ENCAPSULATED_CONTENT, true);
        }
        tb = tb.file_with_id(PathId::for_path(&file.path), &file.path, obj, None);
    }
    let tuple = builder.add(tb);
    builder.add_regular_contents(
        PathId::CAPSULE,
        super::capsule_file_id(&info),
        Sha1Digest::of(pkg.bytes()),
        pkg.bytes().to_vec(),
    );
    Ok(tuple)
}

/// Instruction set flavor for an rpm arch; `noarch` has none
pub fn arch_flavor(arch: &str) -> Flavor {
    if arch.is_empty() || arch == "noarch" {
        Flavor::empty()
    } else {
        Flavor::for_arch(arch)
    }
}

/// The version given to a phantom trove for `nevra`
pub fn phantom_version(nevra: &Nevra) -> Result<Version> {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| if matches!(c, '-' | ':' | '@' | '/') { '_' } else { c })
            .collect()
    };
    let mut upstream = format!("{}_{}", clean(&nevra.version), clean(&nevra.release));
    if !upstream.starts_with(|c: char| c.is_ascii_digit()) {
        upstream.insert(0, '0');
    }
    let stamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let branch = Branch::parse(PHANTOM_BRANCH)?;
    Ok(Version::new(branch, Revision::new(upstream, 1, Some(1)).with_timestamp(stamp)))
}

/// The rpm capsule plugin
pub struct RpmCapsule {
    db: Box<dyn ForeignDb>,
    installs: Vec<StagedPackage>,
    erases: Vec<Nevra>,
    staging: Option<tempfile::TempDir>,
}

impl RpmCapsule {
    pub fn new(db: Box<dyn ForeignDb>) -> Self {
        Self {
            db,
            installs: Vec::new(),
            erases: Vec::new(),
            staging: None,
        }
    }

    fn staging_dir(&mut self) -> Result<PathBuf> {
        if self.staging.is_none() {
            self.staging = Some(tempfile::Builder::new().prefix("capsules-").tempdir()?);
        }
        self.staging
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .ok_or_else(|| Error::CapsuleError("no staging directory".to_string()))
    }

    fn reset(&mut self) {
        self.installs.clear();
        self.erases.clear();
        self.staging = None;
    }

    fn nevra_set(packages: &[InstalledPackage]) -> BTreeSet<String> {
        packages.iter().map(|p| p.nevra.to_string()).collect()
    }
}

fn capsule_of(trove: &Trove) -> Result<&CapsuleInfo> {
    trove
        .info
        .capsule
        .as_ref()
        .ok_or_else(|| Error::CapsuleError(format!("{} is not a capsule trove", trove.tuple())))
}

impl CapsulePlugin for RpmCapsule {
    fn kind(&self) -> &str {
        KIND
    }

    fn check(&self, root: &Path) -> bool {
        self.db.is_available(root)
    }

    fn get_capsule_keys_from_local(&self, store: &TroveStore<'_>) -> Result<Vec<(PartialTuple, TroveTuple)>> {
        let mut out = Vec::new();
        for (tuple, body) in store.get_all_trove_info(info_type::CAPSULE)? {
            let mut info = TroveInfo::default();
            info.set_entry(info_type::CAPSULE, &body)?;
            if let Some(capsule) = info.capsule.filter(|c| c.kind == KIND) {
                out.push((PartialTuple::from_capsule(&capsule), tuple));
            }
        }
        Ok(out)
    }

    fn get_capsule_keys_from_target(&self) -> Result<Vec<PartialTuple>> {
        Ok(self
            .db
            .installed()?
            .iter()
            .map(|p| PartialTuple::from_nevra(&p.nevra, p.header_sha1))
            .collect())
    }

    fn add_phantom_trove(
        &self,
        builder: &mut ChangeSetBuilder,
        root: &Path,
        key: &PartialTuple,
        callback: &dyn UpdateCallback,
        n: usize,
        total: usize,
    ) -> Result<TroveTuple> {
        let installed = self.db.installed()?;
        let pkg = installed
            .iter()
            .find(|p| key.matches(&PartialTuple::from_nevra(&p.nevra, p.header_sha1)))
            .ok_or_else(|| Error::CapsuleError(format!("{} is not installed", key)))?;
        callback.creating_phantom(&pkg.nevra.name, n, total);

        let ids = IdLookup::load(root);
        let version = phantom_version(&pkg.nevra)?;
        let mut tb = TroveBuilder::new(format!("{}:{}", pkg.nevra.name, KIND), version)
            .flavor(arch_flavor(&pkg.nevra.arch))
            .capsule(CapsuleInfo {
                kind: KIND.to_string(),
                name: pkg.nevra.name.clone(),
                epoch: pkg.nevra.epoch,
                version: pkg.nevra.version.clone(),
                release: pkg.nevra.release.clone(),
                arch: pkg.nevra.arch.clone(),
                header_sha1: pkg.header_sha1,
            });

        for file in &pkg.files {
            let real = root.join(file.path.trim_start_matches('/'));
            let Some(template) = file.object(None) else {
                continue;
            };
            let on_disk = FileObject::from_path(&real, &ids, None)?;
            let mut obj = template;
            if let (FileKind::Regular { .. }, Some(disk)) = (&obj.kind, &on_disk)
                && disk.is_regular()
            {
                obj.kind = disk.kind.clone();
            }
            let contents = if file.is_config() && obj.is_regular() && on_disk.is_some() {
                Some(fs::read(&real)?)
            } else {
                obj.flags.set(FileFlags::ENCAPSULATED_CONTENT, true);
                None
            };
            tb = tb.file_with_id(PathId::for_path(&file.path), &file.path, obj, contents.as_deref());
        }
        let tuple = builder.add(tb);
        debug!("phantom trove {} for {}", tuple, pkg.nevra);
        Ok(tuple)
    }

    fn install(&mut self, trove: &Trove, payload: Vec<u8>) -> Result<()> {
        let info = capsule_of(trove)?;
        let package = RpmPackage::parse(payload)?;
        if info.header_sha1.is_some_and(|s| s != package.header_sha1) {
            return Err(Error::CapsuleError(format!(
                "{}: capsule payload does not match its header digest",
                trove.tuple()
            )));
        }
        let path = self.staging_dir()?.join(format!("{}.rpm", package.nevra.nvra()));
        fs::write(&path, package.bytes())?;
        debug!("staged {} for install", package.nevra);
        self.installs.push(StagedPackage { path, package });
        Ok(())
    }

    fn remove(&mut self, trove: &Trove) -> Result<()> {
        let nevra = Nevra::from_capsule(capsule_of(trove)?);
        debug!("staged {} for erase", nevra);
        self.erases.push(nevra);
        Ok(())
    }

    fn apply(&mut self, root: &Path, opts: &ForeignOptions) -> Result<()> {
        if self.installs.is_empty() && self.erases.is_empty() {
            return Ok(());
        }
        let before = self.db.installed()?;
        let mut expected = Self::nevra_set(&before);
        for nevra in &self.erases {
            expected.remove(&nevra.to_string());
        }
        for staged in &self.installs {
            expected.insert(staged.package.nevra.to_string());
        }

        info!(
            "foreign transaction: {} installs, {} erases",
            self.installs.len(),
            self.erases.len()
        );
        let result = self.db.commit(root, &self.erases, &self.installs, opts);
        self.reset();
        result?;

        let found = Self::nevra_set(&self.db.installed()?);
        if found != expected {
            let missing: Vec<_> = expected.difference(&found).cloned().collect();
            let extra: Vec<_> = found.difference(&expected).cloned().collect();
            warn!("foreign database mismatch: missing {:?}, unexpected {:?}", missing, extra);
            return Err(Error::CapsuleError(format!(
                "foreign database does not match the transaction: missing [{}], unexpected [{}]",
                missing.join(", "),
                extra.join(", ")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// (path, mode, contents, rpm file flags)
    pub(crate) type Entry<'a> = (&'a str, u32, &'a [u8], u32);

    /// A gzip-compressed package holding the given regular files
    pub(crate) fn build_rpm(name: &str, version: &str, release: &str, files: &[Entry<'_>]) -> Vec<u8> {
        let sources = tempfile::TempDir::new().unwrap();
        let mut builder = rpm::PackageBuilder::new(name, version, "MIT", "x86_64", "test package")
            .release(release)
            .compression(rpm::CompressionType::Gzip);
        for (n, (path, mode, data, flags)) in files.iter().enumerate() {
            let source = sources.path().join(n.to_string());
            fs::write(&source, data).unwrap();
            let options = rpm::FileOptions::new(*path).mode(rpm::FileMode::from(*mode as i32));
            let options = if flags & file_flag::CONFIG != 0 {
                options.is_config()
            } else {
                options
            };
            builder = builder.with_file(&source, options).unwrap();
        }
        let mut out = Vec::new();
        builder.build().unwrap().write(&mut out).unwrap();
        out
    }

    #[test]
    fn test_parse_package() {
        let data = build_rpm(
            "foo",
            "1.0",
            "1",
            &[
                ("/etc/foo.conf", 0o100644, b"a=1\n", file_flag::CONFIG),
                ("/usr/bin/foo", 0o100755, b"#!/bin/sh\n", 0),
            ],
        );
        let pkg = RpmPackage::parse(data).unwrap();
        assert_eq!(pkg.nevra.nvra(), "foo-1.0-1.x86_64");
        assert_eq!(pkg.files.len(), 2);
        let conf = pkg.files.iter().find(|f| f.path == "/etc/foo.conf").unwrap();
        assert!(conf.is_config());
        assert!(conf.object(None).unwrap().flags.is_config());
        let bin = pkg.files.iter().find(|f| f.path == "/usr/bin/foo").unwrap();
        assert!(!bin.is_config());
        assert_eq!(bin.user, "root");

        let payload = pkg.payload().unwrap();
        assert_eq!(payload["/usr/bin/foo"], b"#!/bin/sh\n");

        let obj = bin.object(Some(b"#!/bin/sh\n")).unwrap();
        assert_eq!(obj.perms, 0o755);
        assert_eq!(obj.contents_sha1(), Some(Sha1Digest::of(b"#!/bin/sh\n")));
    }

    #[test]
    fn test_special_entries() {
        let entry = |path: &str, mode: u32, link_to: &str, rdev: u32| RpmFile {
            path: path.to_string(),
            mode,
            size: 0,
            mtime: 1000,
            rdev,
            user: "root".to_string(),
            group: "root".to_string(),
            link_to: link_to.to_string(),
            flags: 0,
        };
        let link = entry("/usr/bin/foo-link", 0o120777, "foo", 0).object(None).unwrap();
        assert!(link.is_symlink());
        assert_eq!(link.perms, 0o777);
        assert!(entry("/usr/share/foo", 0o040755, "", 0).object(None).unwrap().is_directory());
        assert!(entry("/dev/null", 0o020666, "", 0x0103).object(None).is_some());
        assert!(entry("/weird", 0o170000, "", 0).object(None).is_none());
    }

    #[test]
    fn test_extract() {
        let tmp = tempfile::TempDir::new().unwrap();
        let data = build_rpm(
            "foo",
            "1.0",
            "1",
            &[
                ("/usr/bin/foo", 0o100755, b"bin", 0),
                ("/usr/share/foo/data", 0o100644, b"data", 0),
            ],
        );
        RpmPackage::parse(data).unwrap().extract(tmp.path()).unwrap();
        assert_eq!(fs::read(tmp.path().join("usr/bin/foo")).unwrap(), b"bin");
        assert_eq!(
            fs::metadata(tmp.path().join("usr/bin/foo")).unwrap().permissions().mode() & 0o7777,
            0o755
        );
        assert_eq!(fs::read(tmp.path().join("usr/share/foo/data")).unwrap(), b"data");
    }

    #[test]
    fn test_encapsulate() {
        let data = build_rpm(
            "foo",
            "1.0",
            "1",
            &[
                ("/etc/foo.conf", 0o100644, b"a=1\n", file_flag::CONFIG),
                ("/usr/bin/foo", 0o100755, b"bin", 0),
            ],
        );
        let pkg = RpmPackage::parse(data).unwrap();
        let mut builder = ChangeSetBuilder::new();
        let version = Version::thaw("/repo@ns:1/100.000:1.0-1-1").unwrap();
        let tuple = encapsulate(&mut builder, &pkg, "foo:rpm", version).unwrap();
        let cs = builder.build();

        let trove = &cs.trove_change(&tuple).unwrap().new;
        assert!(trove.is_capsule());
        let conf = cs.get_file(None, trove.files[&PathId::for_path("/etc/foo.conf")].file_id).unwrap().unwrap();
        assert!(!conf.flags.is_encapsulated_content());
        let bin = cs.get_file(None, trove.files[&PathId::for_path("/usr/bin/foo")].file_id).unwrap().unwrap();
        assert!(bin.flags.is_encapsulated_content());

        let id = crate::capsule::capsule_file_id(trove.info.capsule.as_ref().unwrap());
        assert_eq!(id, pkg.header_sha1);
        assert_eq!(cs.get_contents(&PathId::CAPSULE, &id).unwrap().read_all().unwrap(), pkg.bytes());
    }

    #[test]
    fn test_phantom_version() {
        let nevra = Nevra {
            name: "foo".to_string(),
            epoch: Some(1),
            version: "2.0-beta".to_string(),
            release: "3.el9".to_string(),
            arch: "noarch".to_string(),
        };
        let v = phantom_version(&nevra).unwrap();
        assert!(v.is_local());
        assert_eq!(v.trailing_revision().version, "2.0_beta_3.el9");
        assert!(Version::thaw(&v.freeze()).is_ok());
        assert!(arch_flavor("noarch").is_empty());
        assert_eq!(nevra.to_string(), "foo-1:2.0-beta-3.el9.noarch");
    }
}
