//! Side-band multiplexing of pack data, progress text and fatal errors onto one pkt-line stream.

use tokio::io::AsyncWrite;

use super::{
    pktline::{FramingError, MAX_PKT_LEN, PktLineWriter},
    types::{Capability, CapabilitySet},
};

/// Side-band channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideBand {
    /// Sideband 1 contains packfile data
    PackfileData,
    /// Sideband 2 contains progress information
    ProgressInfo,
    /// Sideband 3 contains error information
    Error,
}

impl SideBand {
    pub fn value(&self) -> u8 {
        match self {
            Self::PackfileData => b'\x01',
            Self::ProgressInfo => b'\x02',
            Self::Error => b'\x03',
        }
    }
}

/// Which framing the client negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideBandMode {
    /// Raw pack bytes, no channel tags.
    Disabled,
    /// `side-band`: frames of at most 1000 bytes.
    SideBand,
    /// `side-band-64k`: frames of at most 65520 bytes.
    SideBand64k,
}

impl SideBandMode {
    pub fn from_capabilities(caps: &CapabilitySet) -> Self {
        if caps.contains(&Capability::SideBand64k) {
            SideBandMode::SideBand64k
        } else if caps.contains(&Capability::SideBand) {
            SideBandMode::SideBand
        } else {
            SideBandMode::Disabled
        }
    }

    /// Largest payload per frame after the length prefix and the channel byte.
    pub fn max_payload(&self) -> usize {
        match self {
            SideBandMode::Disabled => usize::MAX,
            SideBandMode::SideBand => 1000 - 5,
            SideBandMode::SideBand64k => MAX_PKT_LEN - 5,
        }
    }
}

/// Writes a response either raw or wrapped in side-band frames.
///
/// Once a channel 3 frame has been written the response is over: later writes fail.
pub struct SideBandWriter<W> {
    writer: PktLineWriter<W>,
    mode: SideBandMode,
    progress: bool,
    terminated: bool,
}

impl<W: AsyncWrite + Unpin> SideBandWriter<W> {
    pub fn new(writer: PktLineWriter<W>, mode: SideBandMode) -> Self {
        Self {
            writer,
            mode,
            progress: true,
            terminated: false,
        }
    }

    /// Drop channel 2 frames (`no-progress`, `quiet`).
    pub fn suppress_progress(mut self, suppress: bool) -> Self {
        self.progress = !suppress;
        self
    }

    pub fn mode(&self) -> SideBandMode {
        self.mode
    }

    async fn send(&mut self, band: SideBand, data: &[u8]) -> Result<(), FramingError> {
        let mut frame = Vec::with_capacity(self.mode.max_payload().min(data.len()) + 1);
        for chunk in data.chunks(self.mode.max_payload()) {
            frame.clear();
            frame.push(band.value());
            frame.extend_from_slice(chunk);
            self.writer.write_data(&frame).await?;
        }
        Ok(())
    }

    fn check_open(&self) -> Result<(), FramingError> {
        if self.terminated {
            return Err(FramingError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "response already terminated by an error frame",
            )));
        }
        Ok(())
    }

    /// Primary data: pack bytes or the framed report-status.
    pub async fn write_data(&mut self, data: &[u8]) -> Result<(), FramingError> {
        self.check_open()?;
        if data.is_empty() {
            return Ok(());
        }
        match self.mode {
            SideBandMode::Disabled => self.writer.write_raw(data).await,
            _ => self.send(SideBand::PackfileData, data).await,
        }
    }

    /// Progress text. Dropped without side-band or when suppressed.
    pub async fn progress(&mut self, message: &str) -> Result<(), FramingError> {
        self.check_open()?;
        if self.mode == SideBandMode::Disabled || !self.progress {
            return Ok(());
        }
        self.send(SideBand::ProgressInfo, message.as_bytes()).await
    }

    /// Fatal error. Without side-band it is sent as an `ERR` pkt-line.
    pub async fn error(&mut self, message: &str) -> Result<(), FramingError> {
        self.check_open()?;
        match self.mode {
            SideBandMode::Disabled => self.writer.write_text(&format!("ERR {message}")).await?,
            _ => self.send(SideBand::Error, message.as_bytes()).await?,
        }
        self.terminated = true;
        self.writer.flush().await
    }

    /// End of the multiplexed stream: a flush-pkt when side-band is active.
    pub async fn finish(&mut self) -> Result<(), FramingError> {
        self.check_open()?;
        if self.mode != SideBandMode::Disabled {
            self.writer.write_flush().await?;
        }
        self.writer.flush().await
    }

    pub fn into_inner(self) -> PktLineWriter<W> {
        self.writer
    }
}
