//! Applies git delta instructions to a base buffer.
//!
//! Stream format: base size and result size as little-endian base-128 varints, then a sequence
//! of ops. An op byte with the msb clear is an insert of the next `op` literal bytes; with the
//! msb set, the low 7 bits say which offset (4) and size (3) bytes follow for a copy from the
//! base. A copy size of zero means 0x10000.

use super::MAX_PREALLOC;
use crate::errors::GitError;

const COPY_INSTRUCTION_FLAG: u8 = 1 << 7;
const COPY_OFFSET_BYTES: u8 = 4;
const COPY_SIZE_BYTES: u8 = 3;
const COPY_ZERO_SIZE: usize = 0x10000;

/// Read a delta header size (7 bits per byte, little-endian) starting at `*pos`.
fn read_size(delta: &[u8], pos: &mut usize) -> Result<usize, GitError> {
    let mut value = 0usize;
    let mut shift = 0;
    loop {
        let byte = *delta
            .get(*pos)
            .ok_or_else(|| GitError::DeltaObjectError("truncated delta header".to_string()))?;
        *pos += 1;
        if shift > usize::BITS - 7 {
            return Err(GitError::DeltaObjectError("delta size overflow".to_string()));
        }
        value |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

/// Read the bytes selected by `flags` (one bit per byte, lowest first) as a little-endian int.
fn read_partial_int(
    delta: &[u8],
    pos: &mut usize,
    bytes: u8,
    flags: &mut u8,
) -> Result<usize, GitError> {
    let mut value = 0usize;
    for i in 0..bytes {
        if *flags & 1 == 1 {
            let byte = *delta
                .get(*pos)
                .ok_or_else(|| GitError::DeltaObjectError("truncated copy op".to_string()))?;
            *pos += 1;
            value |= (byte as usize) << (i * 8);
        }
        *flags >>= 1;
    }
    Ok(value)
}

/// Size of the object `delta` builds, as declared in its header.
pub fn result_size(delta: &[u8]) -> Result<usize, GitError> {
    let mut pos = 0;
    read_size(delta, &mut pos)?;
    read_size(delta, &mut pos)
}

/// Rebuild the target object from `base` and a delta payload.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, GitError> {
    let mut pos = 0;
    let base_size = read_size(delta, &mut pos)?;
    if base.len() != base_size {
        return Err(GitError::DeltaObjectError(format!(
            "base object len is {} but delta expects {}",
            base.len(),
            base_size
        )));
    }
    let result_size = read_size(delta, &mut pos)?;
    let mut buffer = Vec::with_capacity(result_size.min(MAX_PREALLOC));
    let overrun = || {
        GitError::DeltaObjectError(format!("delta writes past its {result_size}-byte result"))
    };

    while pos < delta.len() {
        let instruction = delta[pos];
        pos += 1;

        if instruction & COPY_INSTRUCTION_FLAG == 0 {
            if instruction == 0 {
                return Err(GitError::DeltaObjectError(
                    "invalid data instruction".to_string(),
                ));
            }
            let end = pos + instruction as usize;
            let data = delta
                .get(pos..end)
                .ok_or_else(|| GitError::DeltaObjectError("truncated insert op".to_string()))?;
            if buffer.len() + data.len() > result_size {
                return Err(overrun());
            }
            buffer.extend_from_slice(data);
            pos = end;
        } else {
            let mut flags = instruction;
            let offset = read_partial_int(delta, &mut pos, COPY_OFFSET_BYTES, &mut flags)?;
            let mut size = read_partial_int(delta, &mut pos, COPY_SIZE_BYTES, &mut flags)?;
            if size == 0 {
                size = COPY_ZERO_SIZE;
            }
            let data = offset
                .checked_add(size)
                .and_then(|end| base.get(offset..end))
                .ok_or_else(|| {
                    GitError::DeltaObjectError("copy op outside base object".to_string())
                })?;
            if buffer.len() + data.len() > result_size {
                return Err(overrun());
            }
            buffer.extend_from_slice(data);
        }
    }

    if buffer.len() != result_size {
        return Err(GitError::DeltaObjectError(format!(
            "delta produced {} bytes, expected {}",
            buffer.len(),
            result_size
        )));
    }
    Ok(buffer)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{apply_delta, result_size};
    use crate::errors::GitError;

    /// Hand-assembled delta: copy "hello " from the base, then insert "rust".
    pub(crate) fn sample_delta() -> Vec<u8> {
        let mut delta = vec![11, 10];
        // copy: offset byte present (0), size byte present (6)
        delta.extend_from_slice(&[0x80 | 0x01 | 0x10, 0, 6]);
        delta.push(4);
        delta.extend_from_slice(b"rust");
        delta
    }

    #[test]
    fn applies_copy_and_insert() {
        let out = apply_delta(b"hello world", &sample_delta()).unwrap();
        assert_eq!(out, b"hello rust");
    }

    #[test]
    fn base_size_mismatch_returns_error() {
        let err = apply_delta(b"xx", &sample_delta()).unwrap_err();
        assert!(matches!(err, GitError::DeltaObjectError(_)));
    }

    #[test]
    fn huge_declared_result_is_not_preallocated() {
        // result size 2^55, then a single insert
        let mut delta = vec![11];
        let mut size = 1usize << 55;
        while size >= 0x80 {
            delta.push((size as u8 & 0x7f) | 0x80);
            size >>= 7;
        }
        delta.push(size as u8);
        delta.push(2);
        delta.extend_from_slice(b"hi");
        assert_eq!(result_size(&delta).unwrap(), 1 << 55);
        assert!(matches!(
            apply_delta(b"hello world", &delta),
            Err(GitError::DeltaObjectError(_))
        ));

        // declared 1 byte, writes 4
        let delta = vec![11, 1, 4, b'r', b'u', b's', b't'];
        assert!(apply_delta(b"hello world", &delta).is_err());
    }

    #[test]
    fn copy_past_end_of_base_fails() {
        let delta = vec![2, 4, 0x80 | 0x10, 4];
        assert!(apply_delta(b"ab", &delta).is_err());
    }
}
