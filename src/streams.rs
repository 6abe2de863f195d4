// src/streams.rs

//! Typed-field serialization
//!
//! Every persisted record (file streams, trove digests, changeset records,
//! journal bodies) is a sequence of `(tag:u8, length:varint, body)` fields.
//! Fields are stable-sorted by tag before encoding so the output is canonical:
//! two writers adding the same fields in a different order produce identical
//! bytes, which keeps digests stable.
//!
//! [`StreamSet`] is the keyed form (one body per tag) used for file objects.
//! It supports `diff` and a three-way merge (`twm`) over individual fields.

use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Append a LEB128 varint
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a LEB128 varint, returning the value and the bytes consumed
pub fn read_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, byte) in data.iter().enumerate() {
        if shift >= 64 {
            return Err(Error::ParseError("varint overflow".to_string()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(Error::ShortRead("truncated varint".to_string()))
}

/// Builder for a canonical field sequence
#[derive(Debug, Default, Clone)]
pub struct FieldWriter {
    fields: Vec<(u8, Vec<u8>)>,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&mut self, tag: u8, body: &[u8]) -> &mut Self {
        self.fields.push((tag, body.to_vec()));
        self
    }

    pub fn str(&mut self, tag: u8, body: &str) -> &mut Self {
        self.bytes(tag, body.as_bytes())
    }

    pub fn u8(&mut self, tag: u8, value: u8) -> &mut Self {
        self.bytes(tag, &[value])
    }

    pub fn u16(&mut self, tag: u8, value: u16) -> &mut Self {
        self.bytes(tag, &value.to_be_bytes())
    }

    pub fn u32(&mut self, tag: u8, value: u32) -> &mut Self {
        self.bytes(tag, &value.to_be_bytes())
    }

    pub fn u64(&mut self, tag: u8, value: u64) -> &mut Self {
        self.bytes(tag, &value.to_be_bytes())
    }

    pub fn i64(&mut self, tag: u8, value: i64) -> &mut Self {
        self.bytes(tag, &value.to_be_bytes())
    }

    /// Embed another field sequence as the body of `tag`
    pub fn nested(&mut self, tag: u8, inner: FieldWriter) -> &mut Self {
        let body = inner.finish();
        self.fields.push((tag, body));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Encode. Repeated tags keep their insertion order.
    pub fn finish(mut self) -> Vec<u8> {
        self.fields.sort_by_key(|(tag, _)| *tag);
        let mut out = Vec::new();
        for (tag, body) in &self.fields {
            out.push(*tag);
            write_varint(&mut out, body.len() as u64);
            out.extend_from_slice(body);
        }
        out
    }
}

/// Parsed view over an encoded field sequence
#[derive(Debug, Clone)]
pub struct FieldReader<'a> {
    fields: Vec<(u8, &'a [u8])>,
}

impl<'a> FieldReader<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mut fields = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let tag = data[pos];
            pos += 1;
            let (len, used) = read_varint(&data[pos..])?;
            pos += used;
            let len = len as usize;
            if pos + len > data.len() {
                return Err(Error::ShortRead(format!(
                    "field {} wants {} bytes, {} available",
                    tag,
                    len,
                    data.len() - pos
                )));
            }
            fields.push((tag, &data[pos..pos + len]));
            pos += len;
        }
        Ok(Self { fields })
    }

    /// First body for `tag`
    pub fn get(&self, tag: u8) -> Option<&'a [u8]> {
        self.fields.iter().find(|(t, _)| *t == tag).map(|(_, b)| *b)
    }

    /// All bodies for `tag`, in encoded order
    pub fn all(&self, tag: u8) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.fields
            .iter()
            .filter(move |(t, _)| *t == tag)
            .map(|(_, b)| *b)
    }

    pub fn require(&self, tag: u8) -> Result<&'a [u8]> {
        self.get(tag)
            .ok_or_else(|| Error::ParseError(format!("missing field {}", tag)))
    }

    pub fn string(&self, tag: u8) -> Result<Option<String>> {
        match self.get(tag) {
            None => Ok(None),
            Some(b) => String::from_utf8(b.to_vec())
                .map(Some)
                .map_err(|_| Error::ParseError(format!("field {} is not utf-8", tag))),
        }
    }

    pub fn require_string(&self, tag: u8) -> Result<String> {
        self.string(tag)?
            .ok_or_else(|| Error::ParseError(format!("missing field {}", tag)))
    }

    pub fn u8(&self, tag: u8) -> Result<Option<u8>> {
        self.get(tag).map(|b| fixed::<1>(tag, b).map(|a| a[0])).transpose()
    }

    pub fn u16(&self, tag: u8) -> Result<Option<u16>> {
        self.get(tag)
            .map(|b| fixed::<2>(tag, b).map(u16::from_be_bytes))
            .transpose()
    }

    pub fn u32(&self, tag: u8) -> Result<Option<u32>> {
        self.get(tag)
            .map(|b| fixed::<4>(tag, b).map(u32::from_be_bytes))
            .transpose()
    }

    pub fn u64(&self, tag: u8) -> Result<Option<u64>> {
        self.get(tag)
            .map(|b| fixed::<8>(tag, b).map(u64::from_be_bytes))
            .transpose()
    }

    pub fn i64(&self, tag: u8) -> Result<Option<i64>> {
        self.get(tag)
            .map(|b| fixed::<8>(tag, b).map(i64::from_be_bytes))
            .transpose()
    }
}

fn fixed<const N: usize>(tag: u8, body: &[u8]) -> Result<[u8; N]> {
    body.try_into().map_err(|_| {
        Error::ParseError(format!(
            "field {} has {} bytes, expected {}",
            tag,
            body.len(),
            N
        ))
    })
}

/// Keyed stream: at most one body per tag
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamSet {
    fields: BTreeMap<u8, Vec<u8>>,
}

/// Diff marker bytes
const DIFF_REMOVED: u8 = 0;
const DIFF_SET: u8 = 1;

impl StreamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, tag: u8, body: Vec<u8>) {
        self.fields.insert(tag, body);
    }

    pub fn remove(&mut self, tag: u8) {
        self.fields.remove(&tag);
    }

    pub fn get(&self, tag: u8) -> Option<&[u8]> {
        self.fields.get(&tag).map(|v| v.as_slice())
    }

    pub fn freeze(&self, skip: &[u8]) -> Vec<u8> {
        let mut w = FieldWriter::new();
        for (tag, body) in &self.fields {
            if !skip.contains(tag) {
                w.bytes(*tag, body);
            }
        }
        w.finish()
    }

    pub fn thaw(data: &[u8]) -> Result<Self> {
        let reader = FieldReader::parse(data)?;
        let mut fields = BTreeMap::new();
        for (tag, body) in reader.fields {
            fields.insert(tag, body.to_vec());
        }
        Ok(Self { fields })
    }

    /// Fields that changed going from `old` to `self`
    pub fn diff(&self, old: &StreamSet) -> Vec<u8> {
        let mut w = FieldWriter::new();
        for (tag, body) in &self.fields {
            if old.fields.get(tag) != Some(body) {
                let mut v = Vec::with_capacity(body.len() + 1);
                v.push(DIFF_SET);
                v.extend_from_slice(body);
                w.bytes(*tag, &v);
            }
        }
        for tag in old.fields.keys() {
            if !self.fields.contains_key(tag) {
                w.bytes(*tag, &[DIFF_REMOVED]);
            }
        }
        w.finish()
    }

    /// Apply a diff produced by [`StreamSet::diff`] unconditionally
    pub fn apply_diff(&mut self, diff: &[u8]) -> Result<()> {
        for (tag, change) in decode_diff(diff)? {
            match change {
                Some(body) => self.set(tag, body),
                None => self.remove(tag),
            }
        }
        Ok(())
    }

    /// Three-way merge: `self` is the locally changed object, `base` the
    /// object the diff was computed against.
    ///
    /// A field takes the diff's value when `self` still matches `base`.
    /// A field that was changed locally to something other than the diff's
    /// value is a conflict, unless its tag is in `lenient` (those take the
    /// diff's value only when unchanged and never conflict). Tags in `skip`
    /// are left alone. Returns the conflicting tags.
    pub fn twm(
        &mut self,
        diff: &[u8],
        base: &StreamSet,
        skip: &[u8],
        lenient: &[u8],
    ) -> Result<Vec<u8>> {
        let mut conflicts = Vec::new();
        for (tag, change) in decode_diff(diff)? {
            if skip.contains(&tag) {
                continue;
            }
            let ours = self.fields.get(&tag).cloned();
            let theirs = base.fields.get(&tag).cloned();
            if ours == theirs {
                match change {
                    Some(body) => self.set(tag, body),
                    None => self.remove(tag),
                }
            } else if ours != change && !lenient.contains(&tag) {
                conflicts.push(tag);
            }
        }
        Ok(conflicts)
    }
}

fn decode_diff(diff: &[u8]) -> Result<Vec<(u8, Option<Vec<u8>>)>> {
    let reader = FieldReader::parse(diff)?;
    let mut out = Vec::new();
    for (tag, body) in reader.fields {
        match body.first() {
            Some(&DIFF_SET) => out.push((tag, Some(body[1..].to_vec()))),
            Some(&DIFF_REMOVED) => out.push((tag, None)),
            _ => {
                return Err(Error::ParseError(format!(
                    "bad diff marker for field {}",
                    tag
                )));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for v in [0u64, 1, 127, 128, 300, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            let (back, used) = read_varint(&buf).unwrap();
            assert_eq!(back, v);
            assert_eq!(used, buf.len());
        }
        assert!(read_varint(&[0x80]).is_err());
    }

    #[test]
    fn test_writer_is_canonical() {
        let mut a = FieldWriter::new();
        a.str(3, "c").u16(1, 7).str(2, "b");
        let mut b = FieldWriter::new();
        b.str(2, "b").str(3, "c").u16(1, 7);
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn test_reader_accessors() {
        let mut w = FieldWriter::new();
        w.u32(1, 42).str(2, "x").str(2, "y").u64(9, 5);
        let data = w.finish();
        let r = FieldReader::parse(&data).unwrap();
        assert_eq!(r.u32(1).unwrap(), Some(42));
        assert_eq!(r.all(2).collect::<Vec<_>>(), vec![b"x" as &[u8], b"y"]);
        assert_eq!(r.u64(9).unwrap(), Some(5));
        assert_eq!(r.u16(4).unwrap(), None);
        assert!(r.u16(1).is_err());
    }

    #[test]
    fn test_truncated_field_is_short_read() {
        let mut w = FieldWriter::new();
        w.str(1, "hello");
        let mut data = w.finish();
        data.truncate(data.len() - 2);
        assert!(matches!(FieldReader::parse(&data), Err(Error::ShortRead(_))));
    }

    #[test]
    fn test_diff_apply() {
        let mut old = StreamSet::new();
        old.set(1, b"a".to_vec());
        old.set(2, b"b".to_vec());
        let mut new = StreamSet::new();
        new.set(1, b"a".to_vec());
        new.set(3, b"c".to_vec());

        let diff = new.diff(&old);
        let mut patched = old.clone();
        patched.apply_diff(&diff).unwrap();
        assert_eq!(patched, new);
    }

    #[test]
    fn test_twm_conflicts_only_on_divergent_local_change() {
        let mut base = StreamSet::new();
        base.set(1, b"644".to_vec());
        base.set(2, b"root".to_vec());
        let mut head = base.clone();
        head.set(1, b"600".to_vec());
        head.set(2, b"daemon".to_vec());
        let diff = head.diff(&base);

        // local changed field 2 differently: conflict on 2, field 1 merges
        let mut local = base.clone();
        local.set(2, b"bin".to_vec());
        let conflicts = local.twm(&diff, &base, &[], &[]).unwrap();
        assert_eq!(conflicts, vec![2]);
        assert_eq!(local.get(1), Some(b"600".as_slice()));

        // skipping the field avoids the conflict
        let mut local = base.clone();
        local.set(2, b"bin".to_vec());
        assert!(local.twm(&diff, &base, &[2], &[]).unwrap().is_empty());
        assert_eq!(local.get(2), Some(b"bin".as_slice()));
    }
}
