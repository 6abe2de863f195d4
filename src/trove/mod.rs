// src/trove/mod.rs

//! Troves
//!
//! A trove is a named, versioned, flavored unit of installable content. It
//! lists the files it owns (keyed by [`PathId`]), the troves it includes,
//! what it provides and requires, and a bag of typed auxiliary data
//! ([`TroveInfo`]) such as scripts, the compatibility class and capsule
//! headers.
//!
//! Names containing `:` are components (`foo:runtime`); anything else is a
//! package or group that includes other troves.

use crate::deps::DependencySet;
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::hash::{FileId, PathId, Sha1Digest};
use crate::streams::{FieldReader, FieldWriter};
use crate::version::{Branch, Version};
use md5::{Digest, Md5};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// (name, version, flavor) identity of a trove
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TroveTuple {
    pub name: String,
    pub version: Version,
    pub flavor: Flavor,
}

impl TroveTuple {
    pub fn new(name: impl Into<String>, version: Version, flavor: Flavor) -> Self {
        Self {
            name: name.into(),
            version,
            flavor,
        }
    }

    pub fn is_component(&self) -> bool {
        self.name.contains(':')
    }

    /// `foo` for `foo:runtime`, the name itself otherwise
    pub fn package_name(&self) -> &str {
        self.name.split(':').next().unwrap_or(&self.name)
    }

    /// User and group info troves are installed before anything else
    pub fn is_info(&self) -> bool {
        self.name.starts_with("info-")
    }
}

impl Ord for TroveTuple {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.version.to_string().cmp(&other.version.to_string()))
            .then_with(|| self.flavor.freeze().cmp(&other.flavor.freeze()))
    }
}

impl PartialOrd for TroveTuple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TroveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}{}", self.name, self.version, self.flavor)
    }
}

/// Instance tag stored with every trove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TroveType {
    #[default]
    Normal,
    Redirect,
    Removed,
}

impl TroveType {
    pub fn as_i64(self) -> i64 {
        match self {
            TroveType::Normal => 0,
            TroveType::Redirect => 1,
            TroveType::Removed => 2,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(TroveType::Normal),
            1 => Ok(TroveType::Redirect),
            2 => Ok(TroveType::Removed),
            other => Err(Error::ParseError(format!("unknown trove type {}", other))),
        }
    }
}

/// A file entry in a trove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveFile {
    pub path: String,
    pub file_id: FileId,
    /// Version of the trove that last changed this file
    pub version: Version,
}

/// Flags on an included trove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TroveRef {
    pub by_default: bool,
    pub weak: bool,
}

impl TroveRef {
    pub const WEAK: u8 = 1 << 0;
    pub const BY_DEFAULT: u8 = 1 << 1;

    pub fn strong() -> Self {
        Self {
            by_default: true,
            weak: false,
        }
    }

    pub fn weak() -> Self {
        Self {
            by_default: true,
            weak: true,
        }
    }

    pub fn bits(&self) -> u8 {
        (if self.weak { Self::WEAK } else { 0 }) | (if self.by_default { Self::BY_DEFAULT } else { 0 })
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            by_default: bits & Self::BY_DEFAULT != 0,
            weak: bits & Self::WEAK != 0,
        }
    }
}

/// Target of a redirect trove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub name: String,
    pub branch: Branch,
    pub flavor: Option<Flavor>,
}

/// Trove script hook points
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter, AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum ScriptKind {
    PreInstall,
    PostInstall,
    PreUpdate,
    PostUpdate,
    PreErase,
    PostErase,
    PreRollback,
    PostRollback,
}

impl ScriptKind {
    fn tag(self) -> u8 {
        match self {
            ScriptKind::PreInstall => 1,
            ScriptKind::PostInstall => 2,
            ScriptKind::PreUpdate => 3,
            ScriptKind::PostUpdate => 4,
            ScriptKind::PreErase => 5,
            ScriptKind::PostErase => 6,
            ScriptKind::PreRollback => 7,
            ScriptKind::PostRollback => 8,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        use strum::IntoEnumIterator;
        ScriptKind::iter().find(|k| k.tag() == tag)
    }
}

/// A script shipped with a trove
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TroveScript {
    pub script: String,
    /// (old, new) compatibility class conversions this script handles
    pub conversions: Vec<(u32, u32)>,
}

impl TroveScript {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            conversions: Vec::new(),
        }
    }

    pub fn with_conversion(mut self, old: u32, new: u32) -> Self {
        self.conversions.push((old, new));
        self
    }

    /// Whether the script declares the `old` to `new` class change
    pub fn handles(&self, old: u32, new: u32) -> bool {
        self.conversions.contains(&(old, new))
    }
}

/// Foreign package header data for capsule troves
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapsuleInfo {
    /// Packager kind, e.g. `rpm`
    pub kind: String,
    pub name: String,
    pub epoch: Option<u32>,
    pub version: String,
    pub release: String,
    pub arch: String,
    /// SHA-1 of the immutable header region
    pub header_sha1: Option<Sha1Digest>,
}

/// Canonical digest and opaque detached signatures
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signatures {
    pub digest: Option<Sha1Digest>,
    pub pgp: Vec<Vec<u8>>,
}

/// Typed auxiliary data
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TroveInfo {
    pub size: Option<u64>,
    pub source_name: Option<String>,
    pub build_time: Option<u64>,
    pub compat_class: Option<u32>,
    pub scripts: BTreeMap<ScriptKind, TroveScript>,
    pub capsule: Option<CapsuleInfo>,
    pub sigs: Signatures,
    /// First eight bytes of the md5 of every path the trove owns
    pub path_hashes: BTreeSet<u64>,
}

/// TroveInfo type tags; also the `infoType` column in the local database
pub mod info_type {
    pub const SIZE: u8 = 0;
    pub const SOURCE_NAME: u8 = 1;
    pub const BUILD_TIME: u8 = 2;
    pub const SIGS: u8 = 9;
    pub const PATH_HASHES: u8 = 18;
    pub const COMPAT_CLASS: u8 = 21;
    pub const SCRIPTS: u8 = 22;
    pub const CAPSULE: u8 = 27;
}

impl TroveInfo {
    /// Each present info type with its encoded body
    pub fn entries(&self) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        if let Some(size) = self.size {
            out.push((info_type::SIZE, size.to_be_bytes().to_vec()));
        }
        if let Some(name) = &self.source_name {
            out.push((info_type::SOURCE_NAME, name.as_bytes().to_vec()));
        }
        if let Some(time) = self.build_time {
            out.push((info_type::BUILD_TIME, time.to_be_bytes().to_vec()));
        }
        if self.sigs.digest.is_some() || !self.sigs.pgp.is_empty() {
            let mut w = FieldWriter::new();
            if let Some(digest) = &self.sigs.digest {
                w.bytes(1, digest.as_bytes());
            }
            for sig in &self.sigs.pgp {
                w.bytes(2, sig);
            }
            out.push((info_type::SIGS, w.finish()));
        }
        if !self.path_hashes.is_empty() {
            let body: Vec<u8> = self
                .path_hashes
                .iter()
                .flat_map(|h| h.to_be_bytes())
                .collect();
            out.push((info_type::PATH_HASHES, body));
        }
        if let Some(class) = self.compat_class {
            out.push((info_type::COMPAT_CLASS, class.to_be_bytes().to_vec()));
        }
        if !self.scripts.is_empty() {
            let mut w = FieldWriter::new();
            for (kind, script) in &self.scripts {
                let mut inner = FieldWriter::new();
                inner.str(1, &script.script);
                for (old, new) in &script.conversions {
                    let mut conv = FieldWriter::new();
                    conv.u32(1, *old).u32(2, *new);
                    inner.nested(2, conv);
                }
                w.nested(kind.tag(), inner);
            }
            out.push((info_type::SCRIPTS, w.finish()));
        }
        if let Some(capsule) = &self.capsule {
            let mut w = FieldWriter::new();
            w.str(1, &capsule.kind)
                .str(2, &capsule.name)
                .str(4, &capsule.version)
                .str(5, &capsule.release)
                .str(6, &capsule.arch);
            if let Some(epoch) = capsule.epoch {
                w.u32(3, epoch);
            }
            if let Some(sha1) = &capsule.header_sha1 {
                w.bytes(7, sha1.as_bytes());
            }
            out.push((info_type::CAPSULE, w.finish()));
        }
        out
    }

    /// Set one info type from its encoded body; unknown types are ignored
    pub fn set_entry(&mut self, info: u8, body: &[u8]) -> Result<()> {
        match info {
            info_type::SIZE => self.size = Some(be_u64(body)?),
            info_type::SOURCE_NAME => self.source_name = Some(utf8(body)?),
            info_type::BUILD_TIME => self.build_time = Some(be_u64(body)?),
            info_type::SIGS => {
                let r = FieldReader::parse(body)?;
                self.sigs.digest = r.get(1).map(Sha1Digest::from_slice).transpose()?;
                self.sigs.pgp = r.all(2).map(<[u8]>::to_vec).collect();
            }
            info_type::PATH_HASHES => {
                if body.len() % 8 != 0 {
                    return Err(Error::ParseError("bad path hash list".to_string()));
                }
                self.path_hashes = body
                    .chunks_exact(8)
                    .map(|c| {
                        let mut a = [0u8; 8];
                        a.copy_from_slice(c);
                        u64::from_be_bytes(a)
                    })
                    .collect();
            }
            info_type::COMPAT_CLASS => {
                let a: [u8; 4] = body
                    .try_into()
                    .map_err(|_| Error::ParseError("bad compatibility class".to_string()))?;
                self.compat_class = Some(u32::from_be_bytes(a));
            }
            info_type::SCRIPTS => {
                let r = FieldReader::parse(body)?;
                self.scripts.clear();
                for tag in 1..=8u8 {
                    let (Some(kind), Some(inner)) = (ScriptKind::from_tag(tag), r.get(tag)) else {
                        continue;
                    };
                    let inner = FieldReader::parse(inner)?;
                    let mut script = TroveScript::new(inner.require_string(1)?);
                    for conv in inner.all(2) {
                        let conv = FieldReader::parse(conv)?;
                        script.conversions.push((
                            conv.u32(1)?.unwrap_or(0),
                            conv.u32(2)?.unwrap_or(0),
                        ));
                    }
                    self.scripts.insert(kind, script);
                }
            }
            info_type::CAPSULE => {
                let r = FieldReader::parse(body)?;
                self.capsule = Some(CapsuleInfo {
                    kind: r.require_string(1)?,
                    name: r.require_string(2)?,
                    epoch: r.u32(3)?,
                    version: r.require_string(4)?,
                    release: r.require_string(5)?,
                    arch: r.require_string(6)?,
                    header_sha1: r.get(7).map(Sha1Digest::from_slice).transpose()?,
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn freeze(&self, skip_sigs: bool) -> Vec<u8> {
        let mut w = FieldWriter::new();
        for (info, body) in self.entries() {
            if skip_sigs && info == info_type::SIGS {
                continue;
            }
            w.bytes(info, &body);
        }
        w.finish()
    }

    fn thaw(data: &[u8]) -> Result<Self> {
        let mut info = TroveInfo::default();
        let r = FieldReader::parse(data)?;
        for tag in 0..=u8::MAX {
            if let Some(body) = r.get(tag) {
                info.set_entry(tag, body)?;
            }
        }
        Ok(info)
    }
}

/// md5-based path hash stored in troveinfo
pub fn path_hash(path: &str) -> u64 {
    let mut hasher = Md5::new();
    hasher.update(path.as_bytes());
    let digest = hasher.finalize();
    let mut a = [0u8; 8];
    a.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(a)
}

/// A trove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trove {
    pub name: String,
    pub version: Version,
    pub flavor: Flavor,
    pub trove_type: TroveType,
    pub files: BTreeMap<PathId, TroveFile>,
    pub troves: BTreeMap<TroveTuple, TroveRef>,
    pub provides: DependencySet,
    pub requires: DependencySet,
    pub redirects: Vec<Redirect>,
    pub info: TroveInfo,
}

mod field {
    pub const NAME: u8 = 1;
    pub const VERSION: u8 = 2;
    pub const FLAVOR: u8 = 3;
    pub const TYPE: u8 = 4;
    pub const FILE: u8 = 5;
    pub const TROVE: u8 = 6;
    pub const PROVIDES: u8 = 7;
    pub const REQUIRES: u8 = 8;
    pub const INFO: u8 = 9;
    pub const REDIRECT: u8 = 10;
}

impl Trove {
    pub fn new(name: impl Into<String>, version: Version, flavor: Flavor) -> Self {
        Self {
            name: name.into(),
            version,
            flavor,
            trove_type: TroveType::Normal,
            files: BTreeMap::new(),
            troves: BTreeMap::new(),
            provides: DependencySet::new(),
            requires: DependencySet::new(),
            redirects: Vec::new(),
            info: TroveInfo::default(),
        }
    }

    pub fn tuple(&self) -> TroveTuple {
        TroveTuple::new(self.name.clone(), self.version.clone(), self.flavor.clone())
    }

    pub fn is_component(&self) -> bool {
        self.name.contains(':')
    }

    pub fn is_capsule(&self) -> bool {
        self.info.capsule.is_some()
    }

    pub fn compat_class(&self) -> u32 {
        self.info.compat_class.unwrap_or(0)
    }

    pub fn add_file(&mut self, path_id: PathId, path: impl Into<String>, file_id: FileId, version: Version) {
        self.files.insert(
            path_id,
            TroveFile {
                path: path.into(),
                file_id,
                version,
            },
        );
    }

    pub fn remove_file(&mut self, path_id: &PathId) -> Option<TroveFile> {
        self.files.remove(path_id)
    }

    pub fn file_by_path(&self, path: &str) -> Option<(&PathId, &TroveFile)> {
        self.files.iter().find(|(_, f)| f.path == path)
    }

    pub fn add_trove(&mut self, tuple: TroveTuple, reference: TroveRef) {
        self.troves.insert(tuple, reference);
    }

    fn write(&self, skip_sigs: bool) -> Vec<u8> {
        let mut w = FieldWriter::new();
        w.str(field::NAME, &self.name)
            .str(field::VERSION, &self.version.freeze())
            .str(field::FLAVOR, &self.flavor.freeze())
            .u8(field::TYPE, self.trove_type.as_i64() as u8);
        for (path_id, file) in &self.files {
            let mut inner = FieldWriter::new();
            inner
                .bytes(1, path_id.as_bytes())
                .str(2, &file.path)
                .bytes(3, file.file_id.as_bytes())
                .str(4, &file.version.freeze());
            w.nested(field::FILE, inner);
        }
        for (tuple, reference) in &self.troves {
            let mut inner = FieldWriter::new();
            inner
                .str(1, &tuple.name)
                .str(2, &tuple.version.freeze())
                .str(3, &tuple.flavor.freeze())
                .u8(4, reference.bits());
            w.nested(field::TROVE, inner);
        }
        if !self.provides.is_empty() {
            w.str(field::PROVIDES, &self.provides.freeze());
        }
        if !self.requires.is_empty() {
            w.str(field::REQUIRES, &self.requires.freeze());
        }
        w.bytes(field::INFO, &self.info.freeze(skip_sigs));
        for redirect in &self.redirects {
            let mut inner = FieldWriter::new();
            inner.str(1, &redirect.name).str(2, &redirect.branch.to_string());
            if let Some(flavor) = &redirect.flavor {
                inner.str(3, &flavor.freeze());
            }
            w.nested(field::REDIRECT, inner);
        }
        w.finish()
    }

    /// Full serialized form, including signatures
    pub fn freeze(&self) -> Vec<u8> {
        self.write(false)
    }

    pub fn thaw(data: &[u8]) -> Result<Self> {
        let r = FieldReader::parse(data)?;
        let mut trove = Trove::new(
            r.require_string(field::NAME)?,
            Version::thaw(&r.require_string(field::VERSION)?)?,
            Flavor::thaw(&r.string(field::FLAVOR)?.unwrap_or_default())?,
        );
        trove.trove_type = TroveType::from_i64(r.u8(field::TYPE)?.unwrap_or(0) as i64)?;
        for body in r.all(field::FILE) {
            let f = FieldReader::parse(body)?;
            trove.add_file(
                PathId::from_slice(f.require(1)?)?,
                f.require_string(2)?,
                Sha1Digest::from_slice(f.require(3)?)?,
                Version::thaw(&f.require_string(4)?)?,
            );
        }
        for body in r.all(field::TROVE) {
            let t = FieldReader::parse(body)?;
            trove.add_trove(
                TroveTuple::new(
                    t.require_string(1)?,
                    Version::thaw(&t.require_string(2)?)?,
                    Flavor::thaw(&t.string(3)?.unwrap_or_default())?,
                ),
                TroveRef::from_bits(t.u8(4)?.unwrap_or(TroveRef::BY_DEFAULT)),
            );
        }
        if let Some(p) = r.string(field::PROVIDES)? {
            trove.provides = DependencySet::thaw(&p)?;
        }
        if let Some(p) = r.string(field::REQUIRES)? {
            trove.requires = DependencySet::thaw(&p)?;
        }
        if let Some(info) = r.get(field::INFO) {
            trove.info = TroveInfo::thaw(info)?;
        }
        for body in r.all(field::REDIRECT) {
            let t = FieldReader::parse(body)?;
            trove.redirects.push(Redirect {
                name: t.require_string(1)?,
                branch: Branch::parse(&t.require_string(2)?)?,
                flavor: t.string(3)?.map(|f| Flavor::thaw(&f)).transpose()?,
            });
        }
        Ok(trove)
    }

    /// Canonical sha1 over everything except the signatures themselves
    pub fn compute_digest(&self) -> Sha1Digest {
        Sha1Digest::of(&self.write(true))
    }

    /// Recompute and store the canonical digest; drops stale PGP signatures
    pub fn sign(&mut self) {
        let digest = self.compute_digest();
        if self.info.sigs.digest != Some(digest) {
            self.info.sigs.pgp.clear();
        }
        self.info.sigs.digest = Some(digest);
    }

    /// Check the stored digest, if any
    pub fn verify_digest(&self) -> Result<()> {
        match self.info.sigs.digest {
            Some(stored) if stored != self.compute_digest() => Err(Error::SignatureError(
                format!("digest mismatch for {}", self.tuple()),
            )),
            _ => Ok(()),
        }
    }

    /// Refresh the path hash list from the file manifest
    pub fn compute_path_hashes(&mut self) {
        self.info.path_hashes = self.files.values().map(|f| path_hash(&f.path)).collect();
    }
}

fn be_u64(body: &[u8]) -> Result<u64> {
    let a: [u8; 8] = body
        .try_into()
        .map_err(|_| Error::ParseError("expected 8-byte integer".to_string()))?;
    Ok(u64::from_be_bytes(a))
}

fn utf8(body: &[u8]) -> Result<String> {
    String::from_utf8(body.to_vec()).map_err(|_| Error::ParseError("troveinfo is not UTF-8".to_string()))
}
