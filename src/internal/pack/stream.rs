//! Delimiting a pack on a live byte stream.
//!
//! A pushed pack is not length-prefixed and the client keeps its side of the connection open
//! while it waits for the report, so the end of the pack can only be found by walking its
//! entries: every header is parsed and every zlib stream run to completion, then the trailer
//! is taken. The bytes are returned untouched for [`super::decode::PackDecoder`].

use flate2::{Decompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{PACK_HEADER_LEN, decode::read_entry_header};
use crate::{errors::GitError, hash::HashKind};

/// Longest possible entry header: type/size varint, then an ofs varint or a ref id.
const MAX_ENTRY_HEADER: usize = 20 + 64;

struct Buffered<'r, R> {
    reader: &'r mut R,
    buf: Vec<u8>,
    eof: bool,
    /// Most bytes ever buffered.
    limit: usize,
}

impl<R: AsyncRead + Unpin> Buffered<'_, R> {
    /// Read at least one more byte. `false` at end of stream.
    async fn fill(&mut self) -> Result<bool, GitError> {
        if self.eof {
            return Ok(false);
        }
        let mut chunk = [0u8; 32 * 1024];
        let n = self.reader.read(&mut chunk).await?;
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        if self.buf.len() + n > self.limit {
            return Err(GitError::InvalidPackFile(format!(
                "pack exceeds the {}-byte limit",
                self.limit
            )));
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(true)
    }

    async fn ensure(&mut self, len: usize) -> Result<(), GitError> {
        while self.buf.len() < len {
            if !self.fill().await? {
                return Err(GitError::InvalidPackFile(format!(
                    "pack stream ended after {} bytes",
                    self.buf.len()
                )));
            }
        }
        Ok(())
    }
}

/// Read exactly one pack from `reader`.
///
/// `limit` caps the pack size. Bytes the client sent after the trailer are discarded.
pub async fn read_pack<R: AsyncRead + Unpin>(
    reader: &mut R,
    hash: HashKind,
    limit: usize,
) -> Result<Vec<u8>, GitError> {
    let mut input = Buffered {
        reader,
        buf: Vec::new(),
        eof: false,
        limit,
    };
    input.ensure(PACK_HEADER_LEN).await?;
    if &input.buf[..4] != super::PACK_SIGNATURE {
        return Err(GitError::InvalidPackHeader("missing PACK signature".to_string()));
    }
    let count = u32::from_be_bytes([input.buf[8], input.buf[9], input.buf[10], input.buf[11]]);

    let mut scratch = vec![0u8; 32 * 1024];
    let mut offset = PACK_HEADER_LEN;
    for _ in 0..count {
        let header = loop {
            match read_entry_header(hash, &input.buf, offset) {
                Ok(header) => break header,
                Err(e) => {
                    if input.buf.len() < offset + MAX_ENTRY_HEADER && input.fill().await? {
                        continue;
                    }
                    return Err(e);
                }
            }
        };

        let mut inflater = Decompress::new(true);
        loop {
            let start = header.data_offset + inflater.total_in() as usize;
            if start >= input.buf.len() && !input.fill().await? {
                return Err(GitError::InvalidPackFile(
                    "pack stream ended inside an entry".to_string(),
                ));
            }
            let (before_in, before_out) = (inflater.total_in(), inflater.total_out());
            let status = inflater
                .decompress(&input.buf[start..], &mut scratch, FlushDecompress::None)
                .map_err(|e| GitError::InvalidPackFile(format!("corrupt zlib stream: {e}")))?;
            if status == Status::StreamEnd {
                break;
            }
            let stalled = inflater.total_in() == before_in && inflater.total_out() == before_out;
            if stalled && !input.fill().await? {
                return Err(GitError::InvalidPackFile(
                    "pack stream ended inside an entry".to_string(),
                ));
            }
        }
        offset = header.data_offset + inflater.total_in() as usize;
        if offset > limit {
            return Err(GitError::InvalidPackFile(format!(
                "pack exceeds the {limit}-byte limit"
            )));
        }
    }

    let end = offset + hash.size();
    input.ensure(end).await?;
    if input.buf.len() > end {
        tracing::warn!(extra = input.buf.len() - end, "discarding bytes after pack trailer");
    }
    input.buf.truncate(end);
    Ok(input.buf)
}
