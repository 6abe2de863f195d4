// src/files/mod.rs

//! File objects
//!
//! A [`FileObject`] is the metadata Conary tracks for one path: its kind,
//! contents digest, inode attributes and Conary-specific flags and tags. The
//! frozen form is a kind character followed by a [`StreamSet`]; the file id
//! is the sha1 of that frozen form with the mtime field left out, so touching
//! a file never changes its identity.
//!
//! Diffs between two objects of the same kind carry only the changed fields
//! and start with [`DIFF_MARKER`]. A kind change is shipped as the full
//! frozen object (an "absolute" diff).

pub mod ids;

pub use ids::IdLookup;

use crate::deps::DependencySet;
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::hash::{FileId, Sha1Digest};
use crate::streams::StreamSet;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;
use tracing::debug;

/// First byte of a relative file diff; never a valid kind character
pub const DIFF_MARKER: u8 = 0x01;

/// Field tags inside the frozen stream
pub mod field {
    pub const SIZE: u8 = 1;
    pub const SHA1: u8 = 2;
    pub const DEV_MAJOR: u8 = 3;
    pub const DEV_MINOR: u8 = 4;
    pub const FLAGS: u8 = 5;
    pub const FLAVOR: u8 = 6;
    pub const PERMS: u8 = 7;
    pub const MTIME: u8 = 8;
    pub const OWNER: u8 = 9;
    pub const GROUP: u8 = 10;
    pub const PROVIDES: u8 = 11;
    pub const REQUIRES: u8 = 12;
    pub const TAGS: u8 = 13;
    pub const TARGET: u8 = 14;
    pub const LINK_GROUP: u8 = 15;
}

/// Conary file flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileFlags(u32);

impl FileFlags {
    pub const CONFIG: u32 = 1 << 0;
    pub const INITIAL_CONTENTS: u32 = 1 << 2;
    pub const TRANSIENT: u32 = 1 << 4;
    pub const SOURCE: u32 = 1 << 5;
    pub const AUTO_SOURCE: u32 = 1 << 6;
    /// Contents are owned by a foreign packager
    pub const ENCAPSULATED_CONTENT: u32 = 1 << 7;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub fn set(&mut self, flag: u32, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }

    pub const fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub const fn is_config(&self) -> bool {
        self.has(Self::CONFIG)
    }

    pub const fn is_initial_contents(&self) -> bool {
        self.has(Self::INITIAL_CONTENTS)
    }

    pub const fn is_transient(&self) -> bool {
        self.has(Self::TRANSIENT)
    }

    pub const fn is_source(&self) -> bool {
        self.has(Self::SOURCE)
    }

    pub const fn is_auto_source(&self) -> bool {
        self.has(Self::AUTO_SOURCE)
    }

    pub const fn is_encapsulated_content(&self) -> bool {
        self.has(Self::ENCAPSULATED_CONTENT)
    }
}

/// Device numbers of a block or character device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceNumbers {
    pub major: u32,
    pub minor: u32,
}

/// Kind-specific part of a file object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileKind {
    Regular { sha1: Sha1Digest, size: u64 },
    Directory,
    Symlink { target: String },
    BlockDevice(DeviceNumbers),
    CharDevice(DeviceNumbers),
    Fifo,
    Socket,
    /// The path is recorded but absent on disk
    Missing,
}

impl FileKind {
    /// `ls -l` style type character used as the frozen kind byte
    pub fn type_char(&self) -> u8 {
        match self {
            FileKind::Regular { .. } => b'-',
            FileKind::Directory => b'd',
            FileKind::Symlink { .. } => b'l',
            FileKind::BlockDevice(_) => b'b',
            FileKind::CharDevice(_) => b'c',
            FileKind::Fifo => b'p',
            FileKind::Socket => b's',
            FileKind::Missing => b'm',
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileKind::Regular { .. } => "regular file",
            FileKind::Directory => "directory",
            FileKind::Symlink { .. } => "symbolic link",
            FileKind::BlockDevice(_) => "block device",
            FileKind::CharDevice(_) => "character device",
            FileKind::Fifo => "named pipe",
            FileKind::Socket => "socket",
            FileKind::Missing => "missing file",
        }
    }

    pub(crate) fn same_type(&self, other: &FileKind) -> bool {
        self.type_char() == other.type_char()
    }
}

/// Metadata for one tracked path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileObject {
    pub kind: FileKind,
    pub perms: u16,
    pub mtime: u32,
    pub owner: String,
    pub group: String,
    pub flags: FileFlags,
    /// Sorted, deduplicated tag names
    pub tags: Vec<String>,
    /// Hard link group; regular files only
    pub link_group: Option<Sha1Digest>,
    pub provides: DependencySet,
    pub requires: DependencySet,
    pub flavor: Flavor,
}

impl FileObject {
    fn with_kind(kind: FileKind, perms: u16) -> Self {
        Self {
            kind,
            perms,
            mtime: 0,
            owner: "root".to_string(),
            group: "root".to_string(),
            flags: FileFlags::default(),
            tags: Vec::new(),
            link_group: None,
            provides: DependencySet::new(),
            requires: DependencySet::new(),
            flavor: Flavor::empty(),
        }
    }

    /// Regular file with the digest of `contents`
    pub fn regular(contents: &[u8]) -> Self {
        Self::with_kind(
            FileKind::Regular {
                sha1: Sha1Digest::of(contents),
                size: contents.len() as u64,
            },
            0o644,
        )
    }

    pub fn directory() -> Self {
        Self::with_kind(FileKind::Directory, 0o755)
    }

    pub fn symlink(target: impl Into<String>) -> Self {
        Self::with_kind(
            FileKind::Symlink {
                target: target.into(),
            },
            0o777,
        )
    }

    pub fn fifo() -> Self {
        Self::with_kind(FileKind::Fifo, 0o644)
    }

    pub fn device(block: bool, major: u32, minor: u32) -> Self {
        let numbers = DeviceNumbers { major, minor };
        let kind = if block {
            FileKind::BlockDevice(numbers)
        } else {
            FileKind::CharDevice(numbers)
        };
        Self::with_kind(kind, 0o660)
    }

    pub fn missing() -> Self {
        Self::with_kind(FileKind::Missing, 0)
    }

    pub fn with_perms(mut self, perms: u16) -> Self {
        self.perms = perms;
        self
    }

    pub fn with_owner(mut self, owner: &str, group: &str) -> Self {
        self.owner = owner.to_string();
        self.group = group.to_string();
        self
    }

    pub fn with_mtime(mut self, mtime: u32) -> Self {
        self.mtime = mtime;
        self
    }

    pub fn with_flag(mut self, flag: u32) -> Self {
        self.flags.set(flag, true);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_tags(tags);
        self
    }

    pub fn with_link_group(mut self, group: Sha1Digest) -> Self {
        self.link_group = Some(group);
        self
    }

    pub fn set_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self.tags.sort();
        self.tags.dedup();
    }

    pub fn is_regular(&self) -> bool {
        matches!(self.kind, FileKind::Regular { .. })
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, FileKind::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, FileKind::Symlink { .. })
    }

    /// Contents digest for regular files
    pub fn contents_sha1(&self) -> Option<Sha1Digest> {
        match &self.kind {
            FileKind::Regular { sha1, .. } => Some(*sha1),
            _ => None,
        }
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            FileKind::Regular { size, .. } => *size,
            _ => 0,
        }
    }

    /// Replace the contents digest of a regular file
    pub fn set_contents(&mut self, contents: &[u8]) {
        if let FileKind::Regular { sha1, size } = &mut self.kind {
            *sha1 = Sha1Digest::of(contents);
            *size = contents.len() as u64;
        }
    }

    fn streams(&self) -> StreamSet {
        let mut s = StreamSet::new();
        match &self.kind {
            FileKind::Regular { sha1, size } => {
                s.set(field::SIZE, size.to_be_bytes().to_vec());
                s.set(field::SHA1, sha1.as_bytes().to_vec());
                if let Some(group) = &self.link_group {
                    s.set(field::LINK_GROUP, group.as_bytes().to_vec());
                }
            }
            FileKind::Symlink { target } => s.set(field::TARGET, target.as_bytes().to_vec()),
            FileKind::BlockDevice(dev) | FileKind::CharDevice(dev) => {
                s.set(field::DEV_MAJOR, dev.major.to_be_bytes().to_vec());
                s.set(field::DEV_MINOR, dev.minor.to_be_bytes().to_vec());
            }
            FileKind::Missing => return s,
            FileKind::Directory | FileKind::Fifo | FileKind::Socket => {}
        }

        s.set(field::FLAGS, self.flags.bits().to_be_bytes().to_vec());
        s.set(field::PERMS, self.perms.to_be_bytes().to_vec());
        s.set(field::MTIME, self.mtime.to_be_bytes().to_vec());
        s.set(field::OWNER, self.owner.as_bytes().to_vec());
        s.set(field::GROUP, self.group.as_bytes().to_vec());
        if !self.tags.is_empty() {
            s.set(field::TAGS, self.tags.join("\0").into_bytes());
        }
        if !self.flavor.is_empty() {
            s.set(field::FLAVOR, self.flavor.freeze().into_bytes());
        }
        if !self.provides.is_empty() {
            s.set(field::PROVIDES, self.provides.freeze().into_bytes());
        }
        if !self.requires.is_empty() {
            s.set(field::REQUIRES, self.requires.freeze().into_bytes());
        }
        s
    }

    fn from_streams(kind_char: u8, s: &StreamSet) -> Result<Self> {
        let kind = match kind_char {
            b'-' => FileKind::Regular {
                sha1: Sha1Digest::from_slice(require(s, field::SHA1)?)?,
                size: u64::from_be_bytes(fixed(s, field::SIZE)?),
            },
            b'd' => FileKind::Directory,
            b'l' => FileKind::Symlink {
                target: text(require(s, field::TARGET)?)?,
            },
            b'b' | b'c' => {
                let numbers = DeviceNumbers {
                    major: u32::from_be_bytes(fixed(s, field::DEV_MAJOR)?),
                    minor: u32::from_be_bytes(fixed(s, field::DEV_MINOR)?),
                };
                if kind_char == b'b' {
                    FileKind::BlockDevice(numbers)
                } else {
                    FileKind::CharDevice(numbers)
                }
            }
            b'p' => FileKind::Fifo,
            b's' => FileKind::Socket,
            b'm' => return Ok(Self::missing()),
            other => {
                return Err(Error::ParseError(format!(
                    "unknown file type character {:?}",
                    other as char
                )));
            }
        };

        let mut obj = Self::with_kind(kind, u16::from_be_bytes(fixed(s, field::PERMS)?));
        obj.flags = FileFlags::from_bits(u32::from_be_bytes(fixed(s, field::FLAGS)?));
        obj.mtime = u32::from_be_bytes(fixed(s, field::MTIME)?);
        obj.owner = text(require(s, field::OWNER)?)?;
        obj.group = text(require(s, field::GROUP)?)?;
        if let Some(tags) = s.get(field::TAGS) {
            obj.tags = text(tags)?.split('\0').map(str::to_string).collect();
        }
        if let Some(flavor) = s.get(field::FLAVOR) {
            obj.flavor = Flavor::thaw(&text(flavor)?)?;
        }
        if let Some(provides) = s.get(field::PROVIDES) {
            obj.provides = DependencySet::thaw(&text(provides)?)?;
        }
        if let Some(requires) = s.get(field::REQUIRES) {
            obj.requires = DependencySet::thaw(&text(requires)?)?;
        }
        if let Some(group) = s.get(field::LINK_GROUP) {
            obj.link_group = Some(Sha1Digest::from_slice(group)?);
        }
        Ok(obj)
    }

    /// Canonical serialized form
    pub fn freeze(&self) -> Vec<u8> {
        let mut out = vec![self.kind.type_char()];
        out.extend(self.streams().freeze(&[]));
        out
    }

    pub fn thaw(frozen: &[u8]) -> Result<Self> {
        let (&kind, rest) = frozen
            .split_first()
            .ok_or_else(|| Error::ParseError("empty file stream".to_string()))?;
        Self::from_streams(kind, &StreamSet::thaw(rest)?)
    }

    /// Content-addressed identity; ignores mtime
    pub fn file_id(&self) -> FileId {
        let mut data = vec![self.kind.type_char()];
        data.extend(self.streams().freeze(&[field::MTIME]));
        Sha1Digest::of(&data)
    }

    /// Diff turning `old` into `self`
    pub fn diff(&self, old: &FileObject) -> Vec<u8> {
        if !self.kind.same_type(&old.kind) {
            return self.freeze();
        }
        let mut out = vec![DIFF_MARKER, self.kind.type_char()];
        out.extend(self.streams().diff(&old.streams()));
        out
    }

    /// Whether a stream change is a full object rather than a diff
    pub fn is_absolute(change: &[u8]) -> bool {
        change.first() != Some(&DIFF_MARKER)
    }

    /// Apply a change produced by [`FileObject::diff`] to `base`
    pub fn apply_change(base: &FileObject, change: &[u8]) -> Result<FileObject> {
        if Self::is_absolute(change) {
            return Self::thaw(change);
        }
        let kind = *change
            .get(1)
            .ok_or_else(|| Error::ParseError("truncated file diff".to_string()))?;
        if kind != base.kind.type_char() {
            return Err(Error::ParseError(format!(
                "file diff for type {:?} applied to a {}",
                kind as char,
                base.kind.name()
            )));
        }
        let mut streams = base.streams();
        streams.apply_diff(&change[2..])?;
        Self::from_streams(kind, &streams)
    }

    /// Three-way merge of a change into a locally modified object
    ///
    /// `self` is the object as found on disk, `base` the pristine object the
    /// change was computed against. Returns `false` when a field was changed
    /// both locally and by the change to different values. Mtime never
    /// conflicts; owner and group are left alone when `ignore_ugids` is set.
    pub fn twm(&mut self, change: &[u8], base: &FileObject, ignore_ugids: bool) -> Result<bool> {
        if Self::is_absolute(change) {
            let head = Self::thaw(change)?;
            if self.disk_eq(base, ignore_ugids) {
                *self = head;
                return Ok(true);
            }
            return Ok(false);
        }
        if !self.kind.same_type(&base.kind) {
            return Ok(false);
        }
        let kind = self.kind.type_char();
        let mut ours = self.streams();
        let skip: &[u8] = if ignore_ugids {
            &[field::OWNER, field::GROUP]
        } else {
            &[]
        };
        let conflicts = ours.twm(
            &change[2..],
            &base.streams(),
            skip,
            &[field::MTIME, field::TAGS],
        )?;
        if !conflicts.is_empty() {
            debug!("file stream merge conflicts on fields {:?}", conflicts);
            return Ok(false);
        }
        *self = Self::from_streams(kind, &ours)?;
        Ok(true)
    }

    /// Same type and same contents (digest, target or device numbers)
    pub fn contents_eq(&self, other: &FileObject) -> bool {
        match (&self.kind, &other.kind) {
            (FileKind::Regular { sha1: a, .. }, FileKind::Regular { sha1: b, .. }) => a == b,
            (a, b) => a == b,
        }
    }

    /// Whether the parts visible on disk match: type, contents, mode and
    /// (unless ignored) ownership
    pub fn disk_eq(&self, other: &FileObject, ignore_ugids: bool) -> bool {
        if !self.contents_eq(other) {
            return false;
        }
        if matches!(self.kind, FileKind::Missing) {
            return true;
        }
        if !self.is_symlink() && self.perms != other.perms {
            return false;
        }
        ignore_ugids || (self.owner == other.owner && self.group == other.group)
    }

    /// Capture the object at `path`
    ///
    /// Returns `None` when nothing exists there. Attributes that cannot be
    /// observed on disk (flags, tags, dependencies, flavor, link group) are
    /// copied from `possible_match` when it has the same type; its digest is
    /// reused when size, mode and mtime all agree.
    pub fn from_path(
        path: &Path,
        ids: &IdLookup,
        possible_match: Option<&FileObject>,
    ) -> Result<Option<FileObject>> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let ft = meta.file_type();
        let perms = (meta.mode() & 0o7777) as u16;
        let mtime = meta.mtime().max(0) as u32;

        let kind = if ft.is_symlink() {
            FileKind::Symlink {
                target: fs::read_link(path)?.to_string_lossy().into_owned(),
            }
        } else if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_block_device() || ft.is_char_device() {
            let numbers = DeviceNumbers {
                major: nix::sys::stat::major(meta.rdev()) as u32,
                minor: nix::sys::stat::minor(meta.rdev()) as u32,
            };
            if ft.is_block_device() {
                FileKind::BlockDevice(numbers)
            } else {
                FileKind::CharDevice(numbers)
            }
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            let size = meta.len();
            let reuse = possible_match.and_then(|m| match &m.kind {
                FileKind::Regular { sha1, size: s }
                    if *s == size && m.perms == perms && m.mtime == mtime =>
                {
                    Some(*sha1)
                }
                _ => None,
            });
            let sha1 = match reuse {
                Some(sha1) => sha1,
                None => Sha1Digest::of_reader(&mut fs::File::open(path)?)?,
            };
            FileKind::Regular { sha1, size }
        };

        let mut obj = Self::with_kind(kind, if ft.is_symlink() { 0o777 } else { perms });
        obj.mtime = mtime;
        obj.owner = ids.user_name(meta.uid());
        obj.group = ids.group_name(meta.gid());

        if let Some(m) = possible_match.filter(|m| m.kind.same_type(&obj.kind)) {
            obj.flags = m.flags;
            obj.tags = m.tags.clone();
            obj.provides = m.provides.clone();
            obj.requires = m.requires.clone();
            obj.flavor = m.flavor.clone();
            if obj.is_regular() {
                obj.link_group = m.link_group;
            }
        }
        Ok(Some(obj))
    }

    /// Create this object at `target`
    ///
    /// Regular files need `contents`; they are written to a temporary file in
    /// the same directory and renamed into place. Ownership is only applied
    /// when running as root; otherwise setuid and setgid bits are dropped.
    pub fn restore(
        &self,
        target: &Path,
        contents: Option<&mut dyn Read>,
        ctx: &RestoreContext,
    ) -> Result<()> {
        let parent = target
            .parent()
            .ok_or_else(|| Error::InvalidPath(target.display().to_string()))?;

        match &self.kind {
            FileKind::Regular { .. } => {
                let reader = contents.ok_or_else(|| {
                    Error::IoError(format!("no contents available for {}", target.display()))
                })?;
                let mut tmp = tempfile::Builder::new().prefix(".ct").tempfile_in(parent)?;
                io::copy(reader, tmp.as_file_mut())?;
                tmp.as_file_mut().flush()?;
                tmp.persist(target).map_err(|e| Error::Io(e.error))?;
            }
            FileKind::Directory => match fs::symlink_metadata(target) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    fs::remove_file(target)?;
                    fs::create_dir(target)?;
                }
                Err(_) => fs::create_dir(target)?,
            },
            FileKind::Symlink { target: dest } => {
                let tmp = parent.join(format!(".ct{}", uuid::Uuid::new_v4().simple()));
                std::os::unix::fs::symlink(dest, &tmp)?;
                fs::rename(&tmp, target)?;
            }
            FileKind::BlockDevice(dev) | FileKind::CharDevice(dev) => {
                remove_non_dir(target)?;
                let sflag = if matches!(self.kind, FileKind::BlockDevice(_)) {
                    nix::sys::stat::SFlag::S_IFBLK
                } else {
                    nix::sys::stat::SFlag::S_IFCHR
                };
                nix::sys::stat::mknod(
                    target,
                    sflag,
                    nix::sys::stat::Mode::from_bits_truncate(self.perms as u32),
                    nix::sys::stat::makedev(dev.major as u64, dev.minor as u64),
                )
                .map_err(|e| Error::IoError(format!("mknod {}: {}", target.display(), e)))?;
            }
            FileKind::Fifo => {
                remove_non_dir(target)?;
                nix::unistd::mkfifo(
                    target,
                    nix::sys::stat::Mode::from_bits_truncate(self.perms as u32),
                )
                .map_err(|e| Error::IoError(format!("mkfifo {}: {}", target.display(), e)))?;
            }
            FileKind::Socket => {
                remove_non_dir(target)?;
                drop(std::os::unix::net::UnixListener::bind(target)?);
            }
            FileKind::Missing => {
                remove_non_dir(target)?;
                return Ok(());
            }
        }

        self.apply_inode(target, ctx)
    }

    /// Apply owner, mode and mtime to an existing path
    pub fn apply_inode(&self, target: &Path, ctx: &RestoreContext) -> Result<()> {
        let mut mode = self.perms as u32;
        if ctx.as_root && !ctx.ignore_ugids {
            let uid = ctx.ids.uid(&self.owner);
            let gid = ctx.ids.gid(&self.group);
            if uid.is_none() || gid.is_none() {
                debug!(
                    "unknown owner {}:{} for {}; leaving as root",
                    self.owner,
                    self.group,
                    target.display()
                );
            }
            std::os::unix::fs::lchown(target, Some(uid.unwrap_or(0)), Some(gid.unwrap_or(0)))?;
        } else if !ctx.as_root {
            mode &= !0o6000;
        }

        if !self.is_symlink() {
            fs::set_permissions(target, fs::Permissions::from_mode(mode))?;
            let mtime = nix::sys::time::TimeSpec::new(self.mtime as i64, 0);
            nix::sys::stat::utimensat(
                None,
                target,
                &mtime,
                &mtime,
                nix::sys::stat::UtimensatFlags::NoFollowSymlink,
            )
            .map_err(|e| Error::IoError(format!("utimensat {}: {}", target.display(), e)))?;
        }
        Ok(())
    }
}

/// Settings shared by every restore in a job
#[derive(Debug, Clone)]
pub struct RestoreContext {
    pub ids: IdLookup,
    pub as_root: bool,
    pub ignore_ugids: bool,
}

impl RestoreContext {
    pub fn for_root(root: &Path, ignore_ugids: bool) -> Self {
        Self {
            ids: IdLookup::load(root),
            as_root: nix::unistd::geteuid().is_root(),
            ignore_ugids,
        }
    }
}

fn remove_non_dir(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(Error::IoError(format!(
            "{} is a directory",
            path.display()
        ))),
        Ok(_) => Ok(fs::remove_file(path)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// ELF class (32 or 64) of a binary, if `data` starts with an ELF header
pub fn elf_class(data: &[u8]) -> Option<u8> {
    let header = goblin::elf::Elf::parse_header(data).ok()?;
    match header.e_ident[goblin::elf::header::EI_CLASS] {
        goblin::elf::header::ELFCLASS32 => Some(32),
        goblin::elf::header::ELFCLASS64 => Some(64),
        _ => None,
    }
}

fn require(s: &StreamSet, tag: u8) -> Result<&[u8]> {
    s.get(tag)
        .ok_or_else(|| Error::ParseError(format!("file stream lacks field {}", tag)))
}

fn fixed<const N: usize>(s: &StreamSet, tag: u8) -> Result<[u8; N]> {
    require(s, tag)?
        .try_into()
        .map_err(|_| Error::ParseError(format!("file stream field {} has the wrong size", tag)))
}

fn text(body: &[u8]) -> Result<String> {
    String::from_utf8(body.to_vec())
        .map_err(|_| Error::ParseError("file stream field is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(contents: &[u8]) -> FileObject {
        FileObject::regular(contents)
            .with_flag(FileFlags::CONFIG)
            .with_mtime(1000)
    }

    #[test]
    fn test_freeze_thaw_every_kind() {
        let objects = vec![
            config(b"first\n").with_tags(["initscript", "ldconfig"]),
            FileObject::directory().with_perms(0o700),
            FileObject::symlink("../lib/libfoo.so.1"),
            FileObject::device(true, 8, 1),
            FileObject::device(false, 1, 3),
            FileObject::fifo(),
            FileObject::missing(),
        ];
        for obj in objects {
            let thawed = FileObject::thaw(&obj.freeze()).unwrap();
            assert_eq!(thawed, obj);
            assert_eq!(thawed.file_id(), obj.file_id());
        }
    }

    #[test]
    fn test_file_id_ignores_mtime_only() {
        let a = config(b"x");
        let b = a.clone().with_mtime(99);
        assert_eq!(a.file_id(), b.file_id());
        assert_ne!(a.freeze(), b.freeze());

        let c = a.clone().with_perms(0o600);
        assert_ne!(a.file_id(), c.file_id());
    }

    #[test]
    fn test_diff_and_apply() {
        let old = config(b"first\n");
        let new = config(b"second\n").with_perms(0o600);
        let change = new.diff(&old);
        assert!(!FileObject::is_absolute(&change));
        assert_eq!(FileObject::apply_change(&old, &change).unwrap(), new);

        let link = FileObject::symlink("/etc/other");
        let change = link.diff(&old);
        assert!(FileObject::is_absolute(&change));
        assert_eq!(FileObject::apply_change(&old, &change).unwrap(), link);
    }

    #[test]
    fn test_twm_keeps_local_mode_when_unchanged_upstream() {
        let base = config(b"a");
        let head = config(b"b");
        let mut local = base.clone().with_perms(0o600);

        assert!(local.twm(&head.diff(&base), &base, false).unwrap());
        assert_eq!(local.contents_sha1(), head.contents_sha1());
        assert_eq!(local.perms, 0o600);
    }

    #[test]
    fn test_twm_conflict_and_ignored_owner() {
        let base = config(b"a");
        let head = config(b"a").with_perms(0o640);
        let mut local = base.clone().with_perms(0o600);
        assert!(!local.twm(&head.diff(&base), &base, false).unwrap());

        let head = config(b"a").with_owner("root", "wheel");
        let mut local = base.clone().with_owner("root", "adm");
        assert!(!local.clone().twm(&head.diff(&base), &base, false).unwrap());
        assert!(local.twm(&head.diff(&base), &base, true).unwrap());
        assert_eq!(local.group, "adm");
    }

    #[test]
    fn test_from_path_and_restore() {
        let dir = TempDir::new().unwrap();
        let ctx = RestoreContext::for_root(Path::new("/"), true);

        let obj = FileObject::regular(b"hello\n").with_perms(0o640).with_mtime(12345);
        let target = dir.path().join("hello");
        let mut contents: &[u8] = b"hello\n";
        obj.restore(&target, Some(&mut contents as &mut dyn Read), &ctx)
            .unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"hello\n");

        let found = FileObject::from_path(&target, &ctx.ids, Some(&obj))
            .unwrap()
            .unwrap();
        assert_eq!(found.contents_sha1(), obj.contents_sha1());
        assert_eq!(found.perms, 0o640);
        assert_eq!(found.mtime, 12345);
        assert!(found.disk_eq(&obj, true));

        let link = FileObject::symlink("hello");
        let link_path = dir.path().join("link");
        link.restore(&link_path, None, &ctx).unwrap();
        let found = FileObject::from_path(&link_path, &ctx.ids, None).unwrap().unwrap();
        assert!(found.contents_eq(&link));

        assert!(FileObject::from_path(&dir.path().join("nope"), &ctx.ids, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_regular_restore_needs_contents() {
        let dir = TempDir::new().unwrap();
        let ctx = RestoreContext::for_root(Path::new("/"), true);
        let obj = FileObject::regular(b"x");
        assert!(obj.restore(&dir.path().join("x"), None, &ctx).is_err());
    }

    #[test]
    fn test_elf_class() {
        let mut header = vec![0u8; 64];
        header[..4].copy_from_slice(b"\x7fELF");
        header[4] = 2;
        header[5] = 1;
        header[6] = 1;
        assert_eq!(elf_class(&header), Some(64));
        assert_eq!(elf_class(b"#!/bin/sh\n"), None);
    }
}
