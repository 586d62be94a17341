//! Framing of snapshot blobs.
//!
//! A blob is a bincode payload behind a fixed header:
//!
//! ```text
//! magic "RPLB" | version u16 | crc32 u32 | length u64 | payload
//! ```
//!
//! Integers are little endian. The checksum covers the payload only.

use ripple_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Blob magic bytes.
pub const MAGIC: [u8; 4] = *b"RPLB";

/// Current blob format version.
pub const VERSION: u16 = 1;

const HEADER_LEN: usize = 4 + 2 + 4 + 8;

/// Serializes `value` into a framed blob.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload =
        bincode::serialize(value).map_err(|e| Error::persistence(format!("encode: {e}")))?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Checks the frame of a blob and returns its payload.
pub fn payload(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::recovery(format!(
            "blob truncated: {} bytes, header needs {HEADER_LEN}",
            bytes.len()
        )));
    }
    let (header, payload) = bytes.split_at(HEADER_LEN);
    if header[0..4] != MAGIC {
        return Err(Error::recovery("not a snapshot blob"));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(Error::recovery(format!(
            "unsupported blob version {version}, expected {VERSION}"
        )));
    }
    let crc = u32::from_le_bytes([header[6], header[7], header[8], header[9]]);
    let mut len = [0u8; 8];
    len.copy_from_slice(&header[10..18]);
    let len = u64::from_le_bytes(len);
    if len != payload.len() as u64 {
        return Err(Error::recovery(format!(
            "blob length {} does not match header {len}",
            payload.len()
        )));
    }
    if crc32fast::hash(payload) != crc {
        return Err(Error::recovery("blob checksum mismatch"));
    }
    Ok(payload)
}

/// Checks the frame of a blob and deserializes its payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(payload(bytes)?).map_err(|e| Error::recovery(format!("decode: {e}")))
}

/// Checksum of a complete framed blob, as recorded in the manifest.
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}
