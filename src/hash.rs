// src/hash.rs

//! Digests and identifiers used throughout the engine
//!
//! - **Sha1Digest**: 20-byte SHA-1, used for fileIds, content digests and
//!   the canonical trove digest
//! - **PathId**: 16-byte random identifier of a file slot within a trove
//! - **HashAlgorithm**: digest algorithms found in foreign package headers
//!   (RPM `FILEDIGESTALGO`), used when verifying capsule contents

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

/// Length of a SHA-1 digest in bytes
pub const SHA1_LEN: usize = 20;

/// Length of a pathId in bytes
pub const PATH_ID_LEN: usize = 16;

/// Hash computation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    /// Unknown hash algorithm name or number
    UnknownAlgorithm(String),
    /// Hash string has wrong length for algorithm
    InvalidLength { expected: usize, got: usize },
    /// Hash string contains invalid hex characters
    InvalidHex(String),
}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAlgorithm(name) => write!(f, "unknown hash algorithm: {}", name),
            Self::InvalidLength { expected, got } => {
                write!(f, "invalid hash length: expected {}, got {}", expected, got)
            }
            Self::InvalidHex(s) => write!(f, "invalid hex in hash: {}", s),
        }
    }
}

impl std::error::Error for HashError {}

impl From<HashError> for crate::Error {
    fn from(e: HashError) -> Self {
        crate::Error::ParseError(e.to_string())
    }
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], HashError> {
    if s.len() != N * 2 {
        return Err(HashError::InvalidLength {
            expected: N * 2,
            got: s.len(),
        });
    }
    let bytes = hex::decode(s).map_err(|_| HashError::InvalidHex(s.to_string()))?;
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// A SHA-1 digest
///
/// Used for fileIds (digest of a frozen file stream), content digests of
/// regular files and the canonical trove digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Sha1Digest(pub [u8; SHA1_LEN]);

/// The fileId of a file object: SHA-1 of its frozen stream
pub type FileId = Sha1Digest;

impl Sha1Digest {
    /// The all-zero digest; an absolute file change uses it as the old fileId
    pub const ZERO: Sha1Digest = Sha1Digest([0u8; SHA1_LEN]);

    /// Digest a byte slice
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Digest everything readable from `reader`
    pub fn of_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut hasher = Sha1::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hasher.finalize().into()))
    }

    /// Build a digest from raw bytes, failing on a length mismatch
    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashError> {
        if bytes.len() != SHA1_LEN {
            return Err(HashError::InvalidLength {
                expected: SHA1_LEN,
                got: bytes.len(),
            });
        }
        let mut out = [0u8; SHA1_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    /// Parse from a 40-character hex string
    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        Ok(Self(decode_fixed::<SHA1_LEN>(s)?))
    }

    /// Hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Digest({})", self.to_hex())
    }
}

impl FromStr for Sha1Digest {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Identifier of a logical file slot within a trove
///
/// Random when a file first appears; preserved across versions as long as
/// the logical file is the same.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PathId(pub [u8; PATH_ID_LEN]);

impl PathId {
    /// The pathId reserved for a capsule's package file
    pub const CAPSULE: PathId = PathId([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

    /// Allocate a fresh random pathId
    pub fn random() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    /// Derive a stable pathId from a path (used for phantom troves)
    pub fn for_path(path: &str) -> Self {
        let digest = Sha1Digest::of(path.as_bytes());
        let mut out = [0u8; PATH_ID_LEN];
        out.copy_from_slice(&digest.0[..PATH_ID_LEN]);
        Self(out)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashError> {
        if bytes.len() != PATH_ID_LEN {
            return Err(HashError::InvalidLength {
                expected: PATH_ID_LEN,
                got: bytes.len(),
            });
        }
        let mut out = [0u8; PATH_ID_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        Ok(Self(decode_fixed::<PATH_ID_LEN>(s)?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathId({})", self.to_hex())
    }
}

/// SHA-256 of a byte slice, hex encoded
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Digest algorithms that appear in RPM file digest arrays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// MD5, the historical RPM default
    #[default]
    Md5,
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
}

impl HashAlgorithm {
    /// Map an RPM `FILEDIGESTALGO` value (PGP hash algorithm numbers)
    pub fn from_rpm_algo(algo: u32) -> Result<Self, HashError> {
        match algo {
            1 => Ok(Self::Md5),
            2 => Ok(Self::Sha1),
            8 => Ok(Self::Sha256),
            other => Err(HashError::UnknownAlgorithm(other.to_string())),
        }
    }

    /// Get the algorithm name as a string
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Hex digest of `data`
    pub fn hex_digest(&self, data: &[u8]) -> String {
        match self {
            Self::Md5 => {
                let mut hasher = Md5::new();
                hasher.update(data);
                hex::encode(hasher.finalize())
            }
            Self::Sha1 => Sha1Digest::of(data).to_hex(),
            Self::Sha256 => sha256_hex(data),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            _ => Err(HashError::UnknownAlgorithm(s.to_string())),
        }
    }
}
