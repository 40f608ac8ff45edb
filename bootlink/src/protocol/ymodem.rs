//! XMODEM/YMODEM block-transfer receiver.
//!
//! This module implements the receiving side of the block-transfer protocol
//! used as an alternative bulk channel into the bootloader.
//!
//! ## Protocol Overview
//!
//! ```text
//! Block format:
//! +---------+-----+------+----------------+------------------+
//! | SOH/STX | SEQ | ~SEQ | DATA (128/1024)| SUM (1) / CRC (2)|
//! +---------+-----+------+----------------+------------------+
//!
//! Receiver                         Sender
//!    | ---- 'C' (CRC) or NAK ------> |
//!    | <--- block 1 ---------------- |
//!    | ---- ACK -------------------> |
//!    | <--- block 2 (corrupt) ------ |
//!    | ---- NAK -------------------> |
//!    | <--- block 2 ---------------- |
//!    | ---- ACK -------------------> |
//!    | <--- EOT -------------------- |
//!    | ---- ACK -------------------> |
//! ```
//!
//! An optional YMODEM block 0 (`filename\0size`) is accepted before the first
//! data block. The announced size is used to drop the padding of the last
//! block. One EOT completes the transfer.

use crate::channel::{ChannelError, TimedByteChannel};
use crate::protocol::crc::{checksum8, crc16_xmodem};
use crate::sink::DownloadSink;
use log::{debug, error, trace, warn};
use std::time::{Duration, Instant};
use thiserror::Error;

/// YMODEM control characters.
pub mod control {
    /// Start of Header (128-byte block).
    pub const SOH: u8 = 0x01;
    /// Start of Text (1024-byte block).
    pub const STX: u8 = 0x02;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel.
    pub const CAN: u8 = 0x18;
    /// CRC mode request character.
    pub const C: u8 = b'C';
}

/// Block size for SOH packets.
pub const SOH_BLOCK_SIZE: usize = 128;

/// Block size for STX packets (YMODEM-1K).
pub const STX_BLOCK_SIZE: usize = 1024;

/// Block integrity check negotiated at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChecksumMode {
    /// One-byte additive checksum, requested with NAK.
    Checksum,
    /// CRC16-XMODEM, requested with 'C'.
    #[default]
    Crc16,
}

impl ChecksumMode {
    /// Byte the receiver sends to request a transfer in this mode.
    pub fn start_byte(self) -> u8 {
        match self {
            Self::Checksum => control::NAK,
            Self::Crc16 => control::C,
        }
    }

    fn check_len(self) -> usize {
        match self {
            Self::Checksum => 1,
            Self::Crc16 => 2,
        }
    }

    fn compute(self, payload: &[u8]) -> u16 {
        match self {
            Self::Checksum => u16::from(checksum8(payload)),
            Self::Crc16 => crc16_xmodem(payload),
        }
    }
}

/// Receiver configuration.
///
/// Every wait is performed in `poll_interval` slices so the cancellation
/// predicate is observed promptly even during long protocol timeouts.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct YmodemConfig {
    /// Preferred integrity check.
    pub mode: ChecksumMode,
    /// Granularity of every channel wait.
    pub poll_interval: Duration,
    /// Time between start bytes while waiting for the sender.
    pub start_interval: Duration,
    /// Longest gap tolerated between bytes inside a block.
    pub char_timeout: Duration,
    /// Time to wait for the next block header after ACK/NAK.
    pub block_timeout: Duration,
    /// Start bytes sent before giving up.
    pub max_start_attempts: u32,
    /// Unanswered 'C' requests before falling back to checksum mode (0 = never).
    pub crc_fallback_after: u32,
    /// Consecutive failed block attempts before aborting.
    pub max_retries: u32,
}

impl Default for YmodemConfig {
    fn default() -> Self {
        Self {
            mode: ChecksumMode::Crc16,
            poll_interval: crate::channel::IO_BYTE_TIMEOUT,
            start_interval: Duration::from_secs(3),
            char_timeout: Duration::from_secs(1),
            block_timeout: Duration::from_secs(10),
            max_start_attempts: 20,
            crc_fallback_after: 3,
            max_retries: 10,
        }
    }
}

/// Why a transfer ended without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The sender stopped responding.
    #[error("timed out waiting for the sender")]
    TimeoutExhausted,
    /// Too many corrupted blocks in a row.
    #[error("too many corrupted blocks")]
    ChecksumExhausted,
    /// Too many out-of-sequence blocks in a row.
    #[error("too many out-of-sequence blocks")]
    SequenceExhausted,
    /// Stopped by the local cancellation predicate.
    #[error("cancelled")]
    Cancelled,
    /// The sender cancelled with CAN.
    #[error("cancelled by sender")]
    RemoteCancelled,
    /// The channel failed.
    #[error("channel failure")]
    Channel,
    /// The sink rejected a block.
    #[error("sink rejected data with code {0}")]
    SinkRejected(i16),
}

impl TransferError {
    /// Whether the sender should be told with CAN CAN.
    fn notify_sender(self) -> bool {
        !matches!(self, Self::RemoteCancelled | Self::Channel)
    }
}

/// File description carried in YMODEM block 0.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileInfo {
    /// File name.
    pub name: String,
    /// File size in bytes, if announced.
    pub size: Option<u64>,
}

impl FileInfo {
    /// Parse a block 0 payload: `name\0size[ mtime ...]\0...`.
    ///
    /// Returns `None` for the empty name that terminates a YMODEM batch.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let name_end = payload.iter().position(|&b| b == 0)?;
        if name_end == 0 {
            return None;
        }
        let name = String::from_utf8_lossy(&payload[..name_end]).into_owned();
        let size = payload[name_end + 1..]
            .split(|&b| b == 0 || b == b' ')
            .next()
            .and_then(|field| std::str::from_utf8(field).ok())
            .and_then(|s| s.parse().ok());
        Some(Self { name, size })
    }
}

/// Outcome of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransferSummary {
    /// Data blocks accepted.
    pub blocks: u32,
    /// Bytes delivered to the sink.
    pub bytes: u64,
    /// File description, if the sender provided block 0.
    pub file: Option<FileInfo>,
}

/// Internal wait outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Timeout,
    Failed,
    Cancelled,
    RemoteCancelled,
}

impl From<Wait> for TransferError {
    fn from(wait: Wait) -> Self {
        match wait {
            Wait::Timeout => Self::TimeoutExhausted,
            Wait::Failed => Self::Channel,
            Wait::Cancelled => Self::Cancelled,
            Wait::RemoteCancelled => Self::RemoteCancelled,
        }
    }
}

/// A failed block attempt, counted towards `max_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Timeout,
    Corrupt,
    Sequence,
}

impl Failure {
    fn exhausted(self) -> TransferError {
        match self {
            Self::Timeout => TransferError::TimeoutExhausted,
            Self::Corrupt => TransferError::ChecksumExhausted,
            Self::Sequence => TransferError::SequenceExhausted,
        }
    }
}

/// What to answer after validating a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Ack,
    /// ACK block 0, then request the data blocks.
    AckHeader,
    /// Empty block 0: the batch is over.
    EndOfBatch,
    Nak(Failure),
}

struct RawBlock {
    number: u8,
    complement: u8,
    payload: Vec<u8>,
    check: u16,
}

/// Progress of one receive run.
struct Session {
    mode: ChecksumMode,
    last_accepted: u8,
    failures: u32,
    summary: TransferSummary,
}

/// YMODEM receive handler.
pub struct YmodemReceiver<'a, C: TimedByteChannel> {
    channel: &'a mut C,
    config: YmodemConfig,
    should_stop: Box<dyn Fn() -> bool + 'a>,
}

impl<'a, C: TimedByteChannel> YmodemReceiver<'a, C> {
    /// Create a new receiver with the default configuration.
    pub fn new(channel: &'a mut C) -> Self {
        Self::with_config(channel, YmodemConfig::default())
    }

    /// Create a new receiver with custom configuration.
    ///
    /// The process-wide interrupt checker is used as cancellation predicate.
    pub fn with_config(channel: &'a mut C, config: YmodemConfig) -> Self {
        Self {
            channel,
            config,
            should_stop: Box::new(crate::is_interrupted_requested),
        }
    }

    /// Replace the cancellation predicate.
    #[must_use]
    pub fn with_cancel(mut self, should_stop: impl Fn() -> bool + 'a) -> Self {
        self.should_stop = Box::new(should_stop);
        self
    }

    /// Receive one file into `sink`.
    ///
    /// `progress` is called after every delivered block with the bytes
    /// delivered so far and the announced total, if any.
    pub fn receive<F>(
        &mut self,
        sink: &mut dyn DownloadSink,
        mut progress: F,
    ) -> Result<TransferSummary, TransferError>
    where
        F: FnMut(u64, Option<u64>),
    {
        let result = self.run(sink, &mut progress);
        match &result {
            Ok(summary) => {
                debug!(
                    "Transfer complete: {} blocks, {} bytes",
                    summary.blocks, summary.bytes
                );
            },
            Err(e) => {
                error!("Transfer aborted: {e}");
                if e.notify_sender() {
                    self.send_cancel();
                }
            },
        }
        result
    }

    fn run(
        &mut self,
        sink: &mut dyn DownloadSink,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<TransferSummary, TransferError> {
        let mut session = Session {
            mode: self.config.mode,
            last_accepted: 0,
            failures: 0,
            summary: TransferSummary::default(),
        };

        let mut pending = Some(self.handshake(&mut session)?);
        // Line noise does not extend the wait for the next header
        let mut header_deadline: Option<Instant> = None;

        loop {
            let header = match pending.take() {
                Some(b) => b,
                None => {
                    let window = match header_deadline {
                        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                        None => {
                            header_deadline = Some(Instant::now() + self.config.block_timeout);
                            self.config.block_timeout
                        },
                    };
                    match self.wait_byte(window) {
                        Ok(b) => b,
                        Err(Wait::Timeout) => {
                            header_deadline = None;
                            self.header_timeout(&mut session)?;
                            continue;
                        },
                        Err(e) => return Err(e.into()),
                    }
                },
            };

            let size = match header {
                control::SOH => SOH_BLOCK_SIZE,
                control::STX => STX_BLOCK_SIZE,
                control::EOT => {
                    debug!("EOT received");
                    self.send(control::ACK)?;
                    return Ok(session.summary);
                },
                control::CAN => return Err(TransferError::RemoteCancelled),
                other => {
                    trace!("Ignoring 0x{other:02X} while waiting for a block header");
                    if header_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        header_deadline = None;
                        self.header_timeout(&mut session)?;
                    }
                    continue;
                },
            };
            header_deadline = None;

            let reply = match self.read_block(size, session.mode) {
                Ok(block) => Self::validate(&mut session, &block, sink, progress)?,
                Err(Wait::Timeout) => Reply::Nak(Failure::Timeout),
                Err(e) => return Err(e.into()),
            };

            match reply {
                Reply::Ack => {
                    session.failures = 0;
                    self.send(control::ACK)?;
                },
                Reply::AckHeader => {
                    session.failures = 0;
                    self.send(control::ACK)?;
                    self.send(session.mode.start_byte())?;
                },
                Reply::EndOfBatch => {
                    self.send(control::ACK)?;
                    return Ok(session.summary);
                },
                Reply::Nak(failure) => {
                    self.record_failure(&mut session, failure)?;
                    self.send(control::NAK)?;
                },
            }
        }
    }

    /// Send start bytes until the sender begins. Returns the first header byte.
    fn handshake(&mut self, session: &mut Session) -> Result<u8, TransferError> {
        debug!("Waiting for sender ({:?} mode)", session.mode);

        for attempt in 1..=self.config.max_start_attempts {
            if (self.should_stop)() {
                return Err(TransferError::Cancelled);
            }
            if session.mode == ChecksumMode::Crc16
                && self.config.crc_fallback_after > 0
                && attempt > self.config.crc_fallback_after
            {
                debug!("No answer to 'C', falling back to checksum mode");
                session.mode = ChecksumMode::Checksum;
            }

            self.send(session.mode.start_byte())?;

            match self.wait_byte(self.config.start_interval) {
                Ok(b @ (control::SOH | control::STX | control::EOT | control::CAN)) => {
                    debug!("Sender started after {attempt} attempt(s)");
                    return Ok(b);
                },
                Ok(other) => trace!("Unexpected byte 0x{other:02X} during handshake"),
                Err(Wait::Timeout) => {},
                Err(e) => return Err(e.into()),
            }
        }

        Err(TransferError::TimeoutExhausted)
    }

    /// Read number, complement, payload and check field of one block.
    fn read_block(&mut self, size: usize, mode: ChecksumMode) -> Result<RawBlock, Wait> {
        let mut last = None;
        let number = self.block_byte(&mut last)?;
        let complement = self.block_byte(&mut last)?;

        let mut payload = vec![0u8; size];
        for b in &mut payload {
            *b = self.block_byte(&mut last)?;
        }

        let mut check = 0u16;
        for _ in 0..mode.check_len() {
            check = (check << 8) | u16::from(self.block_byte(&mut last)?);
        }

        Ok(RawBlock {
            number,
            complement,
            payload,
            check,
        })
    }

    /// One byte inside a block. Payloads are binary, so CAN only cancels
    /// when the sender goes quiet right after it.
    fn block_byte(&mut self, last: &mut Option<u8>) -> Result<u8, Wait> {
        match self.wait_byte(self.config.char_timeout) {
            Ok(b) => {
                *last = Some(b);
                Ok(b)
            },
            Err(Wait::Timeout) if *last == Some(control::CAN) => Err(Wait::RemoteCancelled),
            Err(e) => Err(e),
        }
    }

    fn validate(
        session: &mut Session,
        block: &RawBlock,
        sink: &mut dyn DownloadSink,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<Reply, TransferError> {
        if block.number != !block.complement {
            warn!(
                "Block number 0x{:02X} does not match complement 0x{:02X}",
                block.number, block.complement
            );
            return Ok(Reply::Nak(Failure::Corrupt));
        }

        let computed = session.mode.compute(&block.payload);
        if computed != block.check {
            warn!(
                "Block {} check mismatch: expected {:#06x}, got {:#06x}",
                block.number, computed, block.check
            );
            return Ok(Reply::Nak(Failure::Corrupt));
        }

        let summary = &mut session.summary;
        let expected = session.last_accepted.wrapping_add(1);

        if block.number == 0 && summary.blocks == 0 {
            if summary.file.is_none() {
                match FileInfo::parse(&block.payload) {
                    Some(info) => {
                        debug!("File: {} ({:?} bytes)", info.name, info.size);
                        summary.file = Some(info);
                    },
                    None => {
                        debug!("Empty block 0, end of batch");
                        return Ok(Reply::EndOfBatch);
                    },
                }
            }
            return Ok(Reply::AckHeader);
        }

        if block.number == expected {
            let announced = summary.file.as_ref().and_then(|f| f.size);
            let len = announced.map_or(block.payload.len(), |total| {
                let remaining = total.saturating_sub(summary.bytes);
                usize::try_from(remaining)
                    .unwrap_or(usize::MAX)
                    .min(block.payload.len())
            });

            if len > 0 {
                let code = sink.accept_chunk(&block.payload[..len]);
                if code < 0 {
                    return Err(TransferError::SinkRejected(code));
                }
            }

            session.last_accepted = block.number;
            summary.blocks += 1;
            summary.bytes += len as u64;
            trace!("Block {} accepted ({} bytes)", block.number, len);
            progress(summary.bytes, announced);
            return Ok(Reply::Ack);
        }

        if block.number == session.last_accepted && summary.blocks > 0 {
            debug!("Duplicate block {}, acknowledging again", block.number);
            return Ok(Reply::Ack);
        }

        warn!(
            "Out of sequence block {} (expected {})",
            block.number, expected
        );
        Ok(Reply::Nak(Failure::Sequence))
    }

    fn record_failure(&mut self, session: &mut Session, failure: Failure) -> Result<(), TransferError> {
        session.failures += 1;
        debug!(
            "Block attempt failed ({failure:?}), {}/{}",
            session.failures, self.config.max_retries
        );
        if session.failures >= self.config.max_retries {
            return Err(failure.exhausted());
        }
        Ok(())
    }

    /// No usable header arrived in time.
    fn header_timeout(&mut self, session: &mut Session) -> Result<(), TransferError> {
        self.record_failure(session, Failure::Timeout)?;
        self.send(control::NAK)
    }

    /// Wait up to `window` for one byte, polling the cancellation predicate.
    fn wait_byte(&mut self, window: Duration) -> Result<u8, Wait> {
        let poll = self.config.poll_interval;
        for _ in 0..slices(window, poll) {
            if (self.should_stop)() {
                return Err(Wait::Cancelled);
            }
            match self.channel.receive(poll) {
                Ok(b) => return Ok(b),
                Err(ChannelError::Timeout) => {},
                Err(ChannelError::Failed) => return Err(Wait::Failed),
            }
        }
        Err(Wait::Timeout)
    }

    /// Emit one control byte, retrying timeouts for up to `char_timeout`.
    fn send(&mut self, byte: u8) -> Result<(), TransferError> {
        let poll = self.config.poll_interval;
        for _ in 0..slices(self.config.char_timeout, poll) {
            match self.channel.emit(byte, poll) {
                Ok(()) => return Ok(()),
                Err(ChannelError::Timeout) => {},
                Err(ChannelError::Failed) => return Err(TransferError::Channel),
            }
        }
        Err(TransferError::TimeoutExhausted)
    }

    fn send_cancel(&mut self) {
        // Best effort; the transfer is already lost
        let _ = self.send(control::CAN);
        let _ = self.send(control::CAN);
    }
}

/// Number of `poll` sized waits that make up `window` (at least one).
fn slices(window: Duration, poll: Duration) -> u128 {
    (window.as_nanos() / poll.as_nanos().max(1)).max(1)
}
