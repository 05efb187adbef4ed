//! pkt-line framing.
//!
//! Every protocol message is a frame: four lowercase hex digits giving the total frame length
//! (prefix included) followed by the payload. `0000` (flush), `0001` (delim) and `0002`
//! (response end) are payload-less markers. A frame may be at most 65520 bytes long, so the
//! largest payload is 65516 bytes; anything bigger is an encoder error, never a truncation.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PKT_LEN_SIZE: usize = 4;
pub const MAX_PKT_LEN: usize = 65520;
pub const MAX_PKT_PAYLOAD: usize = MAX_PKT_LEN - PKT_LEN_SIZE;

pub const FLUSH_PKT: &[u8; 4] = b"0000";
pub const DELIM_PKT: &[u8; 4] = b"0001";
pub const RESPONSE_END_PKT: &[u8; 4] = b"0002";

#[derive(Error, Debug)]
pub enum FramingError {
    #[error("invalid pkt-line length prefix {0:?}")]
    InvalidPrefix(String),

    #[error("pkt-line length {0} is below the 4-byte minimum")]
    TooShort(usize),

    #[error("pkt-line length {0} exceeds the {MAX_PKT_LEN}-byte maximum")]
    TooLong(usize),

    #[error("payload of {0} bytes does not fit in one pkt-line")]
    PayloadTooLarge(usize),

    #[error("stream ended inside a pkt-line")]
    UnexpectedEof,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    Data(Bytes),
    Flush,
    Delim,
    ResponseEnd,
}

impl PktLine {
    /// Payload as text without the trailing LF, if this is a data frame.
    pub fn as_text(&self) -> Option<&[u8]> {
        match self {
            PktLine::Data(data) => Some(data.strip_suffix(b"\n").unwrap_or(data)),
            _ => None,
        }
    }
}

/// Parse a length prefix. Returns the total frame length (0, 1, 2 for markers).
pub fn parse_length(prefix: &[u8; 4]) -> Result<usize, FramingError> {
    let text = std::str::from_utf8(prefix)
        .map_err(|_| FramingError::InvalidPrefix(format!("{prefix:?}")))?;
    if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(FramingError::InvalidPrefix(text.to_string()));
    }
    let len = usize::from_str_radix(text, 16)
        .map_err(|_| FramingError::InvalidPrefix(text.to_string()))?;
    match len {
        0..=2 => Ok(len),
        3 => Err(FramingError::TooShort(len)),
        n if n > MAX_PKT_LEN => Err(FramingError::TooLong(n)),
        n => Ok(n),
    }
}

/// Append one data frame to `buf`.
pub fn encode_into(buf: &mut BytesMut, payload: &[u8]) -> Result<(), FramingError> {
    if payload.len() > MAX_PKT_PAYLOAD {
        return Err(FramingError::PayloadTooLarge(payload.len()));
    }
    buf.reserve(payload.len() + PKT_LEN_SIZE);
    buf.put(format!("{:04x}", payload.len() + PKT_LEN_SIZE).as_bytes());
    buf.put(payload);
    Ok(())
}

pub fn encode(payload: &[u8]) -> Result<Bytes, FramingError> {
    let mut buf = BytesMut::new();
    encode_into(&mut buf, payload)?;
    Ok(buf.freeze())
}

/// Append a text line, adding the trailing LF git expects.
pub fn add_pkt_line_string(buf: &mut BytesMut, line: &str) -> Result<(), FramingError> {
    if line.ends_with('\n') {
        encode_into(buf, line.as_bytes())
    } else {
        let mut with_lf = String::with_capacity(line.len() + 1);
        with_lf.push_str(line);
        with_lf.push('\n');
        encode_into(buf, with_lf.as_bytes())
    }
}

/// Decode one frame from the front of `buf`. `Ok(None)` means more bytes are needed.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(PktLine, usize)>, FramingError> {
    if buf.len() < PKT_LEN_SIZE {
        return Ok(None);
    }
    let prefix: [u8; 4] = [buf[0], buf[1], buf[2], buf[3]];
    let line = match parse_length(&prefix)? {
        0 => PktLine::Flush,
        1 => PktLine::Delim,
        2 => PktLine::ResponseEnd,
        len => {
            if buf.len() < len {
                return Ok(None);
            }
            return Ok(Some((
                PktLine::Data(Bytes::copy_from_slice(&buf[PKT_LEN_SIZE..len])),
                len,
            )));
        }
    };
    Ok(Some((line, PKT_LEN_SIZE)))
}

/// Reads frames from an async byte stream without buffering past the current frame, so the
/// underlying reader can be handed on (e.g. to read a raw pack) after the last pkt-line.
pub struct PktLineReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> PktLineReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next frame, or `None` on a clean end of stream between frames.
    pub async fn read_pkt(&mut self) -> Result<Option<PktLine>, FramingError> {
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < PKT_LEN_SIZE {
            let n = self.inner.read(&mut prefix[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(FramingError::UnexpectedEof)
                };
            }
            filled += n;
        }
        let line = match parse_length(&prefix)? {
            0 => PktLine::Flush,
            1 => PktLine::Delim,
            2 => PktLine::ResponseEnd,
            len => {
                let mut payload = vec![0u8; len - PKT_LEN_SIZE];
                self.inner
                    .read_exact(&mut payload)
                    .await
                    .map_err(|e| match e.kind() {
                        std::io::ErrorKind::UnexpectedEof => FramingError::UnexpectedEof,
                        _ => FramingError::Io(e),
                    })?;
                PktLine::Data(Bytes::from(payload))
            }
        };
        tracing::trace!(?line, "read pkt-line");
        Ok(Some(line))
    }

    /// Data frames up to the next flush (consumed) or the end of the stream.
    pub async fn read_section(&mut self) -> Result<Vec<Bytes>, FramingError> {
        let mut out = Vec::new();
        while let Some(line) = self.read_pkt().await? {
            match line {
                PktLine::Data(data) => out.push(data),
                PktLine::Flush => break,
                PktLine::Delim | PktLine::ResponseEnd => {}
            }
        }
        Ok(out)
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes frames to an async byte sink.
pub struct PktLineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> PktLineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_data(&mut self, payload: &[u8]) -> Result<(), FramingError> {
        let frame = encode(payload)?;
        self.inner.write_all(&frame).await?;
        Ok(())
    }

    pub async fn write_text(&mut self, line: &str) -> Result<(), FramingError> {
        let mut buf = BytesMut::new();
        add_pkt_line_string(&mut buf, line)?;
        self.inner.write_all(&buf).await?;
        Ok(())
    }

    pub async fn write_flush(&mut self) -> Result<(), FramingError> {
        self.inner.write_all(FLUSH_PKT).await?;
        Ok(())
    }

    /// Raw bytes, already framed or deliberately unframed.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        self.inner.write_all(bytes).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), FramingError> {
        self.inner.flush().await?;
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
