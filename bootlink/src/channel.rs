//! Timed single-byte channel shared by both protocols.
//!
//! Every protocol in this crate talks to the link one byte at a time through
//! [`TimedByteChannel`]. Each operation is bounded by a timeout and reports one
//! of three outcomes:
//!
//! ```text
//! Ok(..)                       byte transferred
//! Err(ChannelError::Timeout)   nothing transferred, channel healthy, retry later
//! Err(ChannelError::Failed)    channel unusable, abandon the current session
//! ```
//!
//! Keeping every wait short is what lets the cooperative loops above this
//! layer re-check their cancellation predicate and refresh the watchdog.

use std::io::{self, Read, Write};
use std::time::Duration;

use log::trace;
use thiserror::Error;

/// Recommended per-byte timeout for protocol loops.
///
/// Protocol-level timeouts (whole blocks, whole messages) are seconds-scale and
/// are built out of many waits of this size.
pub const IO_BYTE_TIMEOUT: Duration = Duration::from_millis(1);

/// Non-success outcome of a single-byte channel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// No byte was transferred within the timeout.
    #[error("byte timed out")]
    Timeout,
    /// The channel is unusable.
    #[error("channel failed")]
    Failed,
}

impl ChannelError {
    /// Whether the caller may simply try again.
    pub fn is_timeout(self) -> bool {
        self == Self::Timeout
    }
}

/// Result of a single-byte channel operation.
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// A byte link with bounded waits.
///
/// Implementations must return within `timeout` plus scheduling slop.
pub trait TimedByteChannel {
    /// Sends one byte.
    fn emit(&mut self, byte: u8, timeout: Duration) -> ChannelResult<()>;

    /// Receives one byte.
    fn receive(&mut self, timeout: Duration) -> ChannelResult<u8>;
}

impl<T: TimedByteChannel + ?Sized> TimedByteChannel for &mut T {
    fn emit(&mut self, byte: u8, timeout: Duration) -> ChannelResult<()> {
        (**self).emit(byte, timeout)
    }

    fn receive(&mut self, timeout: Duration) -> ChannelResult<u8> {
        (**self).receive(timeout)
    }
}

/// Adapts any blocking `Read + Write` stream to [`TimedByteChannel`].
///
/// The stream is expected to enforce its own read timeout; the `timeout`
/// argument is not applied here. `TimedOut`, `WouldBlock` and zero-length
/// reads map to [`ChannelError::Timeout`], every other I/O error to
/// [`ChannelError::Failed`].
#[derive(Debug)]
pub struct IoChannel<P> {
    inner: P,
}

impl<P: Read + Write> IoChannel<P> {
    /// Wraps a stream.
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    /// Returns the wrapped stream.
    pub fn into_inner(self) -> P {
        self.inner
    }

    /// Borrows the wrapped stream.
    pub fn get_ref(&self) -> &P {
        &self.inner
    }
}

fn classify(err: &io::Error) -> ChannelError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
            ChannelError::Timeout
        },
        _ => {
            trace!("channel I/O failure: {err}");
            ChannelError::Failed
        },
    }
}

impl<P: Read + Write> TimedByteChannel for IoChannel<P> {
    fn emit(&mut self, byte: u8, _timeout: Duration) -> ChannelResult<()> {
        match self.inner.write(&[byte]) {
            Ok(1) => self.inner.flush().map_err(|e| classify(&e)),
            Ok(_) => Err(ChannelError::Timeout),
            Err(e) => Err(classify(&e)),
        }
    }

    fn receive(&mut self, _timeout: Duration) -> ChannelResult<u8> {
        let mut buf = [0u8; 1];
        match self.inner.read(&mut buf) {
            Ok(1) => Ok(buf[0]),
            Ok(_) => Err(ChannelError::Timeout),
            Err(e) => Err(classify(&e)),
        }
    }
}
