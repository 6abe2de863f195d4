// src/capsule/payload.rs

//! Package payload decompression
//!
//! The compressor is named by the header's `PAYLOADCOMPRESSOR` tag; older
//! packages omit it and are sniffed from their leading bytes instead.

use crate::error::{Error, Result};
use std::io::Read;

/// Payload compressors found in the wild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
    /// Raw `.lzma` stream, pre-xz packages
    Lzma,
    Zstd,
}

impl Compression {
    /// Map a `PAYLOADCOMPRESSOR` value
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "gzip" => Ok(Self::Gzip),
            "bzip2" => Ok(Self::Bzip2),
            "xz" => Ok(Self::Xz),
            "lzma" => Ok(Self::Lzma),
            "zstd" => Ok(Self::Zstd),
            "" | "none" | "identity" => Ok(Self::None),
            other => Err(Error::CapsuleError(format!(
                "unsupported payload compressor {}",
                other
            ))),
        }
    }

    /// Detect the compressor from magic bytes
    ///
    /// - gzip: `1f 8b`
    /// - bzip2: `BZh`
    /// - xz: `fd 37 7a 58 5a 00`
    /// - zstd: `28 b5 2f fd`
    /// - lzma: `5d 00 00`
    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if data.starts_with(b"BZh") {
            Self::Bzip2
        } else if data.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
            Self::Xz
        } else if data.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Self::Zstd
        } else if data.starts_with(&[0x5d, 0x00, 0x00]) {
            Self::Lzma
        } else {
            Self::None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
            Self::Lzma => "lzma",
            Self::Zstd => "zstd",
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A decompressing reader over `reader`
pub fn decoder<'a, R: Read + 'a>(reader: R, format: Compression) -> Result<Box<dyn Read + 'a>> {
    match format {
        Compression::None => Ok(Box::new(reader)),
        Compression::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(reader))),
        Compression::Bzip2 => Ok(Box::new(bzip2::read::BzDecoder::new(reader))),
        Compression::Xz => Ok(Box::new(xz2::read::XzDecoder::new(reader))),
        Compression::Lzma => {
            let stream = xz2::stream::Stream::new_lzma_decoder(u64::MAX).map_err(|e| {
                Error::CapsuleError(format!("failed to create lzma decoder: {}", e))
            })?;
            Ok(Box::new(xz2::read::XzDecoder::new_stream(reader, stream)))
        }
        Compression::Zstd => {
            let decoder = zstd::Decoder::new(reader).map_err(|e| {
                Error::CapsuleError(format!("failed to create zstd decoder: {}", e))
            })?;
            Ok(Box::new(decoder))
        }
    }
}

/// Decoder for a payload whose compressor name may be missing
pub fn payload_decoder<'a>(data: &'a [u8], compressor: Option<&str>) -> Result<Box<dyn Read + 'a>> {
    let format = match compressor {
        Some(name) => Compression::from_name(name)?,
        None => Compression::from_magic_bytes(data),
    };
    decoder(data, format)
}
