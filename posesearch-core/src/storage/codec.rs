//! Framing of serialized search indexes.
//!
//! # Format
//!
//! ```text
//! [magic:4]["PSIX"][version:u32][checksum:u32][length:u32][payload:json]
//! ```
//!
//! The checksum is the crc32 of the payload. Every integer is little endian.

use crate::error::{Error, Result};
use crate::search_index::SearchIndex;

pub const MAGIC: [u8; 4] = *b"PSIX";

/// Blob layout version; unrelated to the cache key version.
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 16;

/// Serializes `index` into a framed blob.
pub fn encode(index: &SearchIndex) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(index)
        .map_err(|e| Error::Serialization(format!("search index serialization failed: {}", e)))?;
    let length = u32::try_from(payload.len())
        .map_err(|_| Error::Serialization(format!("payload too large: {} bytes", payload.len())))?;
    let checksum = crc32fast::hash(&payload);

    let mut blob = Vec::with_capacity(HEADER_LEN + payload.len());
    blob.extend_from_slice(&MAGIC);
    blob.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    blob.extend_from_slice(&checksum.to_le_bytes());
    blob.extend_from_slice(&length.to_le_bytes());
    blob.extend_from_slice(&payload);
    Ok(blob)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

/// Parses a framed blob. Any framing or decoding problem is
/// `Error::CacheCorrupted`.
pub fn decode(bytes: &[u8]) -> Result<SearchIndex> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::CacheCorrupted(format!(
            "blob too short: {} bytes",
            bytes.len()
        )));
    }
    if bytes[..4] != MAGIC {
        return Err(Error::CacheCorrupted("bad magic".into()));
    }
    let version = read_u32(bytes, 4);
    if version != FORMAT_VERSION {
        return Err(Error::CacheCorrupted(format!(
            "unsupported version: expected {}, got {}",
            FORMAT_VERSION, version
        )));
    }
    let expected_checksum = read_u32(bytes, 8);
    let length = read_u32(bytes, 12) as usize;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != length {
        return Err(Error::CacheCorrupted(format!(
            "length mismatch: expected {}, got {}",
            length,
            payload.len()
        )));
    }
    let actual_checksum = crc32fast::hash(payload);
    if actual_checksum != expected_checksum {
        return Err(Error::CacheCorrupted(format!(
            "checksum mismatch: expected {}, got {}",
            expected_checksum, actual_checksum
        )));
    }
    serde_json::from_slice(payload)
        .map_err(|e| Error::CacheCorrupted(format!("deserialization failed: {}", e)))
}
