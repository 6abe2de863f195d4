// src/capsule/header.rs

//! Package file framing
//!
//! A package file is laid out as
//!
//! ```text
//! lead (96 bytes) | signature header | pad to 8 | header | payload
//! ```
//!
//! Parsing is done by [`rpm::Package`]. This module adds the checks the
//! capsule code relies on: distinct errors for truncated input, bad magic
//! and a digest mismatch, plus the SHA-1 of the main header blob, which is
//! how a capsule is identified.

use crate::error::{Error, Result};
use crate::hash::Sha1Digest;
use rpm::{IndexTag, Package};
use std::io::Cursor;

pub const LEAD_MAGIC: [u8; 4] = [0xed, 0xab, 0xee, 0xdb];
pub const LEAD_SIZE: usize = 96;
pub const HEADER_MAGIC: [u8; 4] = [0x8e, 0xad, 0xe8, 0x01];

/// Magic, reserved bytes, entry count and data size
const INTRO_SIZE: usize = 16;
const ENTRY_SIZE: usize = 16;

/// A parsed package and the digest of its main header
#[derive(Debug)]
pub struct PackageHeaders {
    pub package: Package,
    /// SHA-1 of the main header blob
    pub header_sha1: Sha1Digest,
    pub payload_offset: usize,
}

impl PackageHeaders {
    /// A string tag of the main header
    pub fn string(&self, tag: IndexTag) -> Option<&str> {
        self.package.metadata.header.get_entry_data_as_string(tag).ok()
    }

    /// An integer array tag of the main header; empty when absent
    pub fn u32s(&self, tag: IndexTag) -> Vec<u32> {
        self.package
            .metadata
            .header
            .get_entry_data_as_u32_array(tag)
            .map(|values| values.iter().map(|v| u32::from(*v)).collect())
            .unwrap_or_default()
    }

    /// A 16-bit array tag of the main header; empty when absent
    pub fn u16s(&self, tag: IndexTag) -> Vec<u32> {
        self.package
            .metadata
            .header
            .get_entry_data_as_u16_array(tag)
            .map(|values| values.iter().map(|v| u32::from(*v)).collect())
            .unwrap_or_default()
    }
}

fn be32(bytes: &[u8], at: usize) -> usize {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]) as usize
}

/// Check the lead and the signature header intro; returns where the main
/// header starts
fn header_offset(data: &[u8]) -> Result<usize> {
    if data.len() < LEAD_SIZE + INTRO_SIZE {
        return Err(Error::ShortRead(format!(
            "rpm lead and signature intro need {} bytes, have {}",
            LEAD_SIZE + INTRO_SIZE,
            data.len()
        )));
    }
    if data[..4] != LEAD_MAGIC {
        return Err(Error::InvalidMagic(format!(
            "rpm lead magic {}",
            hex::encode(&data[..4])
        )));
    }
    let intro = &data[LEAD_SIZE..LEAD_SIZE + INTRO_SIZE];
    if intro[..4] != HEADER_MAGIC {
        return Err(Error::InvalidMagic(format!(
            "rpm signature header magic {}",
            hex::encode(&intro[..4])
        )));
    }
    let signature_len = INTRO_SIZE + be32(intro, 8) * ENTRY_SIZE + be32(intro, 12);
    let padded = signature_len + (8 - signature_len % 8) % 8;
    Ok(LEAD_SIZE + padded)
}

/// Parse a package held in memory
///
/// The digests recorded in the signature header must match the header and
/// payload.
pub fn read_package(data: &[u8]) -> Result<PackageHeaders> {
    let start = header_offset(data)?;
    let package = Package::parse(&mut Cursor::new(data))
        .map_err(|e| Error::IncompleteHeader(format!("rpm headers: {}", e)))?;
    package
        .verify_digests()
        .map_err(|e| Error::SignatureError(format!("rpm digests: {}", e)))?;

    let end = data
        .len()
        .checked_sub(package.content.len())
        .filter(|end| *end >= start)
        .ok_or_else(|| Error::IncompleteHeader("rpm header overlaps its payload".to_string()))?;
    Ok(PackageHeaders {
        header_sha1: Sha1Digest::of(&data[start..end]),
        payload_offset: end,
        package,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::rpm::tests::build_rpm;

    fn sample() -> Vec<u8> {
        build_rpm("bash", "5.2", "1", &[("/bin/bash", 0o100755, b"#!ELF\n", 0)])
    }

    #[test]
    fn test_package_layout() {
        let pkg = sample();
        let headers = read_package(&pkg).unwrap();
        assert_eq!(headers.package.metadata.get_name().unwrap(), "bash");
        assert_eq!(headers.string(IndexTag::RPMTAG_VERSION), Some("5.2"));
        assert_eq!(&pkg[headers.payload_offset..], headers.package.content.as_slice());

        let start = header_offset(&pkg).unwrap();
        assert_eq!(start % 8, 0);
        assert_eq!(&pkg[start..start + 4], &HEADER_MAGIC);
        assert_eq!(headers.header_sha1, Sha1Digest::of(&pkg[start..headers.payload_offset]));
    }

    #[test]
    fn test_bad_framing() {
        let pkg = sample();
        assert!(matches!(read_package(&pkg[..40]), Err(Error::ShortRead(_))));

        let mut bad = pkg.clone();
        bad[0] = 0;
        assert!(matches!(read_package(&bad), Err(Error::InvalidMagic(_))));

        let mut bad = pkg.clone();
        bad[LEAD_SIZE] = 0;
        assert!(matches!(read_package(&bad), Err(Error::InvalidMagic(_))));

        assert!(matches!(
            read_package(&pkg[..LEAD_SIZE + INTRO_SIZE + 4]),
            Err(Error::IncompleteHeader(_))
        ));
    }

    #[test]
    fn test_tampered_payload_fails_digest() {
        let mut pkg = sample();
        let last = pkg.len() - 1;
        pkg[last] ^= 0xff;
        assert!(matches!(read_package(&pkg), Err(Error::SignatureError(_))));
    }
}
