//! Pack writer.
//!
//! Objects are written whole (no deltas), so every entry is its own base and the
//! bases-before-deltas ordering rule holds trivially. The encoder is sans-io: it hands back byte
//! chunks so the caller can push them through side-band framing as they are produced.

use std::io::Write;

use flate2::{Compression, write::ZlibEncoder};

use super::{PACK_SIGNATURE, PACK_VERSION};
use crate::{
    errors::GitError,
    hash::{HashKind, Hasher},
    internal::object::{ObjectKind, RawObject},
};

pub struct PackEncoder {
    hasher: Hasher,
    object_number: usize,
    written: usize,
}

impl PackEncoder {
    pub fn new(hash: HashKind, object_number: usize) -> Self {
        Self {
            hasher: Hasher::new(hash),
            object_number,
            written: 0,
        }
    }

    /// `PACK`, version, object count.
    pub fn header(&mut self) -> Result<Vec<u8>, GitError> {
        let count = u32::try_from(self.object_number).map_err(|_| {
            GitError::PackEncodeError(format!("too many objects: {}", self.object_number))
        })?;
        let mut out = Vec::with_capacity(12);
        out.extend_from_slice(PACK_SIGNATURE);
        out.extend_from_slice(&PACK_VERSION.to_be_bytes());
        out.extend_from_slice(&count.to_be_bytes());
        self.hasher.update(&out);
        Ok(out)
    }

    /// One whole-object entry: type/size header plus zlib body.
    pub fn entry(&mut self, kind: ObjectKind, data: &[u8]) -> Result<Vec<u8>, GitError> {
        if self.written == self.object_number {
            return Err(GitError::PackEncodeError(format!(
                "pack declared {} objects, refusing to write more",
                self.object_number
            )));
        }
        let mut out = encode_entry_header(kind.to_pack_type_u8(), data.len());
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        out.extend_from_slice(&encoder.finish()?);
        self.hasher.update(&out);
        self.written += 1;
        Ok(out)
    }

    /// Trailing checksum. Fails if fewer entries than declared were written.
    pub fn finish(self) -> Result<Vec<u8>, GitError> {
        if self.written != self.object_number {
            return Err(GitError::PackEncodeError(format!(
                "pack declared {} objects but {} were written",
                self.object_number, self.written
            )));
        }
        Ok(self.hasher.finalize().to_data())
    }
}

/// Type in bits 4..6 of the first byte, size as 4 bits then 7-bit continuation groups.
pub fn encode_entry_header(type_id: u8, size: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut byte = (type_id << 4) | (size as u8 & 0x0f);
    let mut rest = size >> 4;
    while rest > 0 {
        out.push(byte | 0x80);
        byte = (rest & 0x7f) as u8;
        rest >>= 7;
    }
    out.push(byte);
    out
}

/// Encode a complete pack in memory.
pub fn encode_pack(hash: HashKind, objects: &[RawObject]) -> Result<Vec<u8>, GitError> {
    let mut encoder = PackEncoder::new(hash, objects.len());
    let mut out = encoder.header()?;
    for object in objects {
        out.extend(encoder.entry(object.kind, &object.data)?);
    }
    out.extend(encoder.finish()?);
    Ok(out)
}
