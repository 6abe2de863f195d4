// src/changeset/mod.rs

//! Change sets
//!
//! A change set carries everything needed to move a system from one set of
//! troves to another:
//!
//! - trove changes: the complete new trove, plus the (version, flavor) it
//!   replaces when the change is relative
//! - old troves: troves to erase
//! - file stream changes keyed by (old file id, new file id); a zero old id
//!   means the stream is the absolute frozen file object
//! - file contents keyed by (path id, file id): full contents, a line diff
//!   for config files, a pointer to another entry with the same contents,
//!   or a placeholder when the contents were not captured
//!
//! The on-disk container is a magic header followed by framed records
//! `(kind: u8, len: u32, crc32: u32, body)`. Contents bodies are gzip'd
//! individually so a file-backed change set can read them on demand.

mod builder;

pub use builder::{ChangeSetBuilder, TroveBuilder};

use crate::error::{Error, Result};
use crate::files::FileObject;
use crate::flavor::Flavor;
use crate::hash::{FileId, PathId, Sha1Digest};
use crate::resolver::Job;
use crate::streams::{FieldReader, FieldWriter};
use crate::trove::{Trove, TroveTuple};
use crate::version::Version;
use flate2::Compression;
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Container magic
pub const MAGIC: &[u8; 6] = b"CNYCS\x01";

mod record {
    pub const TROVE: u8 = 1;
    pub const OLD_TROVE: u8 = 2;
    pub const FILE_STREAM: u8 = 3;
    pub const CONTENTS: u8 = 4;
    pub const PRIMARY: u8 = 5;
    pub const END: u8 = 0xff;
}

/// One trove change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveChange {
    /// Version and flavor being replaced; `None` for absolute changes
    pub old: Option<(Version, Flavor)>,
    pub new: Trove,
}

impl TroveChange {
    pub fn absolute(new: Trove) -> Self {
        Self { old: None, new }
    }

    pub fn relative(old: &TroveTuple, new: Trove) -> Self {
        Self {
            old: Some((old.version.clone(), old.flavor.clone())),
            new,
        }
    }

    pub fn is_absolute(&self) -> bool {
        self.old.is_none()
    }

    pub fn new_tuple(&self) -> TroveTuple {
        self.new.tuple()
    }

    pub fn old_tuple(&self) -> Option<TroveTuple> {
        self.old
            .as_ref()
            .map(|(v, f)| TroveTuple::new(self.new.name.clone(), v.clone(), f.clone()))
    }

    fn freeze(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        if let Some((version, flavor)) = &self.old {
            w.str(1, &version.freeze()).str(2, &flavor.freeze());
        }
        w.bytes(3, &self.new.freeze());
        w.finish()
    }

    fn thaw(body: &[u8]) -> Result<Self> {
        let r = FieldReader::parse(body)?;
        let old = match r.string(1)? {
            Some(v) => Some((
                Version::thaw(&v)?,
                Flavor::thaw(&r.string(2)?.unwrap_or_default())?,
            )),
            None => None,
        };
        Ok(Self {
            old,
            new: Trove::thaw(r.require(3)?)?,
        })
    }
}

/// How a contents entry is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    /// Full file contents
    Regular,
    /// Unified diff from the previous version's contents
    Diff,
    /// Same contents as another entry
    Ptr { path_id: PathId, file_id: FileId },
    /// Contents were not captured
    Hldr,
}

impl ContentKind {
    fn tag(&self) -> u8 {
        match self {
            ContentKind::Regular => 1,
            ContentKind::Diff => 2,
            ContentKind::Ptr { .. } => 3,
            ContentKind::Hldr => 4,
        }
    }
}

#[derive(Debug, Clone)]
enum ContentSource {
    Memory(Arc<Vec<u8>>),
    /// gzip'd bytes at `offset` in a container file
    File {
        path: Arc<PathBuf>,
        offset: u64,
        len: u64,
    },
    None,
}

/// A contents entry; data is read on demand
#[derive(Debug, Clone)]
pub struct ContentEntry {
    pub kind: ContentKind,
    source: ContentSource,
}

impl ContentEntry {
    pub fn regular(data: Vec<u8>) -> Self {
        Self {
            kind: ContentKind::Regular,
            source: ContentSource::Memory(Arc::new(data)),
        }
    }

    pub fn diff(data: Vec<u8>) -> Self {
        Self {
            kind: ContentKind::Diff,
            source: ContentSource::Memory(Arc::new(data)),
        }
    }

    pub fn ptr(path_id: PathId, file_id: FileId) -> Self {
        Self {
            kind: ContentKind::Ptr { path_id, file_id },
            source: ContentSource::None,
        }
    }

    pub fn hldr() -> Self {
        Self {
            kind: ContentKind::Hldr,
            source: ContentSource::None,
        }
    }

    /// Stream the data of a regular or diff entry
    pub fn reader(&self) -> Result<Box<dyn Read + Send>> {
        match &self.source {
            ContentSource::Memory(data) => Ok(Box::new(Cursor::new(SharedBytes(data.clone())))),
            ContentSource::File { path, offset, len } => {
                let mut file = File::open(path.as_path())?;
                file.seek(SeekFrom::Start(*offset))?;
                Ok(Box::new(GzDecoder::new(BufReader::new(file.take(*len)))))
            }
            ContentSource::None => Err(Error::IoError(format!(
                "contents entry of kind {:?} has no data",
                self.kind
            ))),
        }
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.reader()?.read_to_end(&mut out)?;
        Ok(out)
    }
}

#[derive(Debug, Clone)]
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// A change set
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    troves: BTreeMap<TroveTuple, TroveChange>,
    old_troves: Vec<TroveTuple>,
    file_streams: BTreeMap<(FileId, FileId), Vec<u8>>,
    contents: BTreeMap<(PathId, FileId), ContentEntry>,
    primaries: Vec<TroveTuple>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.troves.is_empty() && self.old_troves.is_empty()
    }

    pub fn add_trove_change(&mut self, change: TroveChange) {
        self.troves.insert(change.new_tuple(), change);
    }

    /// Trove changes sorted by new tuple
    pub fn trove_changes(&self) -> impl Iterator<Item = &TroveChange> {
        self.troves.values()
    }

    pub fn trove_change(&self, tuple: &TroveTuple) -> Option<&TroveChange> {
        self.troves.get(tuple)
    }

    pub fn add_old_trove(&mut self, tuple: TroveTuple) {
        if !self.old_troves.contains(&tuple) {
            self.old_troves.push(tuple);
            self.old_troves.sort();
        }
    }

    pub fn old_troves(&self) -> &[TroveTuple] {
        &self.old_troves
    }

    pub fn add_primary(&mut self, tuple: TroveTuple) {
        if !self.primaries.contains(&tuple) {
            self.primaries.push(tuple);
        }
    }

    pub fn primaries(&self) -> &[TroveTuple] {
        &self.primaries
    }

    /// Record a file stream change; pass `None` as `old` for an absolute stream
    pub fn add_file_stream(&mut self, old: Option<FileId>, new: FileId, stream: Vec<u8>) {
        self.file_streams
            .insert((old.unwrap_or(Sha1Digest::ZERO), new), stream);
    }

    /// Raw stream change, preferring a diff from `old` over an absolute stream
    pub fn file_change(&self, old: Option<FileId>, new: FileId) -> Option<&[u8]> {
        old.and_then(|o| self.file_streams.get(&(o, new)))
            .or_else(|| self.file_streams.get(&(Sha1Digest::ZERO, new)))
            .map(Vec::as_slice)
    }

    /// The new file object, given the old one when a diff is shipped
    pub fn get_file(&self, old: Option<(&FileObject, FileId)>, new: FileId) -> Result<Option<FileObject>> {
        let Some(change) = self.file_change(old.map(|(_, id)| id), new) else {
            return Ok(None);
        };
        let obj = if FileObject::is_absolute(change) {
            FileObject::thaw(change)?
        } else {
            let (base, _) = old.ok_or_else(|| {
                Error::FileStreamMissing(format!("{} (diff without a base)", new))
            })?;
            FileObject::apply_change(base, change)?
        };
        if obj.file_id() != new {
            return Err(Error::SignatureError(format!(
                "file stream {} does not match its id",
                new
            )));
        }
        Ok(Some(obj))
    }

    pub fn add_contents(&mut self, path_id: PathId, file_id: FileId, entry: ContentEntry) {
        self.contents.insert((path_id, file_id), entry);
    }

    pub fn get_contents(&self, path_id: &PathId, file_id: &FileId) -> Option<&ContentEntry> {
        self.contents.get(&(*path_id, *file_id))
    }

    /// The entry holding data for (path id, file id), following one pointer
    pub fn resolve_contents(&self, path_id: &PathId, file_id: &FileId) -> Option<&ContentEntry> {
        let entry = self.get_contents(path_id, file_id)?;
        match &entry.kind {
            ContentKind::Ptr { path_id, file_id } => self.get_contents(path_id, file_id),
            _ => Some(entry),
        }
    }

    /// Contents entries in (path id, file id) order
    pub fn contents(&self) -> impl Iterator<Item = (&(PathId, FileId), &ContentEntry)> {
        self.contents.iter()
    }

    /// The subset of this change set covering `jobs`
    ///
    /// Trove changes and erasures not named by a job are dropped; file
    /// streams and contents are kept whole since troves share them.
    pub fn select(&self, jobs: &[Job]) -> ChangeSet {
        let mut out = ChangeSet {
            file_streams: self.file_streams.clone(),
            contents: self.contents.clone(),
            ..Default::default()
        };
        for job in jobs {
            match &job.new {
                Some(new) => {
                    if let Some(change) = self.troves.get(new) {
                        out.add_trove_change(change.clone());
                    }
                }
                None => {
                    if let Some(old) = &job.old {
                        out.add_old_trove(old.clone());
                    }
                }
            }
            if let Some(p) = job.primary().filter(|p| self.primaries.contains(p)) {
                out.add_primary(p.clone());
            }
        }
        out
    }

    /// Fold another change set into this one
    pub fn merge(&mut self, other: ChangeSet) {
        self.troves.extend(other.troves);
        for old in other.old_troves {
            self.add_old_trove(old);
        }
        self.file_streams.extend(other.file_streams);
        self.contents.extend(other.contents);
        for p in other.primaries {
            self.add_primary(p);
        }
    }

    /// Serialize the container
    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(MAGIC)?;
        for primary in &self.primaries {
            write_record(out, record::PRIMARY, &freeze_tuple(primary))?;
        }
        for change in self.troves.values() {
            write_record(out, record::TROVE, &change.freeze())?;
        }
        for old in &self.old_troves {
            write_record(out, record::OLD_TROVE, &freeze_tuple(old))?;
        }
        for ((old, new), stream) in &self.file_streams {
            let mut body = Vec::with_capacity(40 + stream.len());
            body.extend_from_slice(old.as_bytes());
            body.extend_from_slice(new.as_bytes());
            body.extend_from_slice(stream);
            write_record(out, record::FILE_STREAM, &body)?;
        }
        for ((path_id, file_id), entry) in &self.contents {
            let mut body = Vec::new();
            body.extend_from_slice(path_id.as_bytes());
            body.extend_from_slice(file_id.as_bytes());
            body.push(entry.kind.tag());
            match &entry.kind {
                ContentKind::Regular | ContentKind::Diff => {
                    let data = entry.read_all()?;
                    let mut gz = flate2::GzBuilder::new()
                        .mtime(0)
                        .write(Vec::new(), Compression::default());
                    gz.write_all(&data)?;
                    body.extend(gz.finish()?);
                }
                ContentKind::Ptr { path_id, file_id } => {
                    body.extend_from_slice(path_id.as_bytes());
                    body.extend_from_slice(file_id.as_bytes());
                }
                ContentKind::Hldr => {}
            }
            write_record(out, record::CONTENTS, &body)?;
        }
        write_record(out, record::END, &[])?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write(&mut out)?;
        Ok(out)
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(path.parent().unwrap_or(Path::new(".")))?;
        self.write(tmp.as_file_mut())?;
        tmp.as_file_mut().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Load a container file; contents stay on disk until read
    pub fn read_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let shared = Arc::new(path.to_path_buf());
        let cs = Self::parse(&data, Some(&shared))?;
        debug!(
            "read change set {} ({} troves, {} contents)",
            path.display(),
            cs.troves.len(),
            cs.contents.len()
        );
        Ok(cs)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::parse(data, None)
    }

    fn parse(data: &[u8], backing: Option<&Arc<PathBuf>>) -> Result<Self> {
        if data.len() < MAGIC.len() {
            return Err(Error::ShortRead("change set shorter than its header".to_string()));
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(Error::InvalidMagic("not a change set".to_string()));
        }
        let mut cs = ChangeSet::new();
        let mut pos = MAGIC.len();
        loop {
            if data.len() < pos + 9 {
                return Err(Error::IncompleteHeader(format!(
                    "record header truncated at offset {}",
                    pos
                )));
            }
            let kind = data[pos];
            let len = u32::from_be_bytes([data[pos + 1], data[pos + 2], data[pos + 3], data[pos + 4]])
                as usize;
            let crc = u32::from_be_bytes([data[pos + 5], data[pos + 6], data[pos + 7], data[pos + 8]]);
            let start = pos + 9;
            if data.len() < start + len {
                return Err(Error::ShortRead(format!(
                    "record at offset {} wants {} bytes",
                    pos, len
                )));
            }
            let body = &data[start..start + len];
            if crc32fast::hash(body) != crc {
                return Err(Error::ParseError(format!(
                    "checksum mismatch in record at offset {}",
                    pos
                )));
            }
            pos = start + len;

            match kind {
                record::END => break,
                record::PRIMARY => cs.add_primary(thaw_tuple(body)?),
                record::TROVE => cs.add_trove_change(TroveChange::thaw(body)?),
                record::OLD_TROVE => cs.add_old_trove(thaw_tuple(body)?),
                record::FILE_STREAM => {
                    if body.len() < 40 {
                        return Err(Error::ShortRead("file stream record".to_string()));
                    }
                    let old = Sha1Digest::from_slice(&body[..20])?;
                    let new = Sha1Digest::from_slice(&body[20..40])?;
                    cs.file_streams.insert((old, new), body[40..].to_vec());
                }
                record::CONTENTS => {
                    if body.len() < 37 {
                        return Err(Error::ShortRead("contents record".to_string()));
                    }
                    let path_id = PathId::from_slice(&body[..16])?;
                    let file_id = Sha1Digest::from_slice(&body[16..36])?;
                    let payload = &body[37..];
                    let entry = match body[36] {
                        1 | 2 => {
                            let source = match backing {
                                Some(path) => ContentSource::File {
                                    path: path.clone(),
                                    offset: (start + 37) as u64,
                                    len: payload.len() as u64,
                                },
                                None => {
                                    let mut raw = Vec::new();
                                    GzDecoder::new(payload).read_to_end(&mut raw)?;
                                    ContentSource::Memory(Arc::new(raw))
                                }
                            };
                            let kind = if body[36] == 1 {
                                ContentKind::Regular
                            } else {
                                ContentKind::Diff
                            };
                            ContentEntry { kind, source }
                        }
                        3 => {
                            if payload.len() != 36 {
                                return Err(Error::ShortRead("pointer contents".to_string()));
                            }
                            ContentEntry::ptr(
                                PathId::from_slice(&payload[..16])?,
                                Sha1Digest::from_slice(&payload[16..])?,
                            )
                        }
                        4 => ContentEntry::hldr(),
                        other => {
                            return Err(Error::ParseError(format!(
                                "unknown contents type {}",
                                other
                            )));
                        }
                    };
                    cs.contents.insert((path_id, file_id), entry);
                }
                other => {
                    return Err(Error::ParseError(format!("unknown record type {}", other)));
                }
            }
        }
        Ok(cs)
    }
}

fn write_record<W: Write>(out: &mut W, kind: u8, body: &[u8]) -> Result<()> {
    out.write_all(&[kind])?;
    out.write_all(&(body.len() as u32).to_be_bytes())?;
    out.write_all(&crc32fast::hash(body).to_be_bytes())?;
    out.write_all(body)?;
    Ok(())
}

fn freeze_tuple(tuple: &TroveTuple) -> Vec<u8> {
    let mut w = FieldWriter::new();
    w.str(1, &tuple.name)
        .str(2, &tuple.version.freeze())
        .str(3, &tuple.flavor.freeze());
    w.finish()
}

fn thaw_tuple(body: &[u8]) -> Result<TroveTuple> {
    let r = FieldReader::parse(body)?;
    Ok(TroveTuple::new(
        r.require_string(1)?,
        Version::thaw(&r.require_string(2)?)?,
        Flavor::thaw(&r.string(3)?.unwrap_or_default())?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::FileFlags;
    use tempfile::TempDir;

    fn version(s: &str) -> Version {
        Version::thaw(&format!("/conary.example.com@rpl:2/{}", s)).unwrap()
    }

    fn sample() -> ChangeSet {
        let mut b = ChangeSetBuilder::new();
        b.add(
            TroveBuilder::new("foo:runtime", version("1000.000:1.0-1-1"))
                .file(
                    "/etc/foo",
                    FileObject::regular(b"first\n").with_flag(FileFlags::CONFIG),
                    b"first\n",
                )
                .file("/usr/share/foo/a", FileObject::regular(b"same"), b"same")
                .file("/usr/share/foo/b", FileObject::regular(b"same"), b"same"),
        );
        b.erase(TroveTuple::new("bar:runtime", version("900.000:0.9-1-1"), Flavor::empty()));
        b.build()
    }

    #[test]
    fn test_bytes_roundtrip_is_stable() {
        let cs = sample();
        let bytes = cs.to_bytes().unwrap();
        let parsed = ChangeSet::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
        assert_eq!(parsed.old_troves().len(), 1);
        assert_eq!(parsed.trove_changes().count(), 1);
    }

    #[test]
    fn test_file_backed_contents_are_lazy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.ccs");
        let cs = sample();
        cs.write_to_file(&path).unwrap();

        let parsed = ChangeSet::read_file(&path).unwrap();
        let trove = &parsed.trove_changes().next().unwrap().new;
        let (path_id, file) = trove.file_by_path("/etc/foo").unwrap();
        let entry = parsed.get_contents(path_id, &file.file_id).unwrap();
        assert!(matches!(entry.source, ContentSource::File { .. }));
        assert_eq!(entry.read_all().unwrap(), b"first\n");
        // readable more than once
        assert_eq!(entry.read_all().unwrap(), b"first\n");

        let obj = parsed.get_file(None, file.file_id).unwrap().unwrap();
        assert!(obj.flags.is_config());
    }

    #[test]
    fn test_identical_contents_use_pointer() {
        let cs = sample();
        let kinds: Vec<_> = cs.contents().map(|(_, e)| e.kind).collect();
        assert_eq!(kinds.iter().filter(|k| matches!(k, ContentKind::Ptr { .. })).count(), 1);
        assert_eq!(kinds.iter().filter(|k| matches!(k, ContentKind::Regular)).count(), 2);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(ChangeSet::from_bytes(b"CNY"), Err(Error::ShortRead(_))));
        assert!(matches!(ChangeSet::from_bytes(b"XXXXXX\x00"), Err(Error::InvalidMagic(_))));

        let mut bytes = sample().to_bytes().unwrap();
        bytes.truncate(MAGIC.len() + 4);
        assert!(matches!(ChangeSet::from_bytes(&bytes), Err(Error::IncompleteHeader(_))));

        let mut bytes = sample().to_bytes().unwrap();
        let last = bytes.len() - 20;
        bytes[last] ^= 0xff;
        assert!(ChangeSet::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_select_keeps_named_jobs() {
        let cs = sample();
        let foo = cs.trove_changes().next().unwrap().new_tuple();
        let bar = cs.old_troves()[0].clone();

        let only_foo = cs.select(&[Job::install(foo.clone())]);
        assert!(only_foo.trove_change(&foo).is_some());
        assert!(only_foo.old_troves().is_empty());
        assert_eq!(only_foo.contents().count(), cs.contents().count());

        let only_bar = cs.select(&[Job::erase(bar.clone())]);
        assert_eq!(only_bar.trove_changes().count(), 0);
        assert_eq!(only_bar.old_troves(), &[bar]);
    }

    #[test]
    fn test_relative_stream_lookup() {
        let old = FileObject::regular(b"a");
        let new = FileObject::regular(b"b");
        let mut cs = ChangeSet::new();
        cs.add_file_stream(Some(old.file_id()), new.file_id(), new.diff(&old));

        let got = cs
            .get_file(Some((&old, old.file_id())), new.file_id())
            .unwrap()
            .unwrap();
        assert_eq!(got, new);
        assert!(cs.get_file(None, new.file_id()).unwrap().is_none());
    }
}
