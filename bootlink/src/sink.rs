//! Consumers of received image data.

use std::io::Write;

use log::warn;

/// Status code a sink returns when its underlying writer failed.
pub const SINK_IO_ERROR: i16 = -5;

/// Receives image data chunks in stream order.
///
/// Both the framed upgrade session and the block-transfer receiver feed one of
/// these. Any negative return value is fatal for the transfer in progress and
/// is reported back to the host.
pub trait DownloadSink {
    /// Consume the next chunk. Returns a non-negative value on success or a
    /// negative error code.
    fn accept_chunk(&mut self, data: &[u8]) -> i16;
}

impl DownloadSink for Vec<u8> {
    fn accept_chunk(&mut self, data: &[u8]) -> i16 {
        self.extend_from_slice(data);
        0
    }
}

impl<T: DownloadSink + ?Sized> DownloadSink for &mut T {
    fn accept_chunk(&mut self, data: &[u8]) -> i16 {
        (**self).accept_chunk(data)
    }
}

/// Adapts any `std::io::Write` into a [`DownloadSink`].
#[derive(Debug)]
pub struct WriterSink<W: Write> {
    writer: W,
    written: u64,
}

impl<W: Write> WriterSink<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and return the writer.
    pub fn finish(mut self) -> std::io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: Write> DownloadSink for WriterSink<W> {
    fn accept_chunk(&mut self, data: &[u8]) -> i16 {
        match self.writer.write_all(data) {
            Ok(()) => {
                self.written += data.len() as u64;
                0
            },
            Err(e) => {
                warn!("Sink write failed: {e}");
                SINK_IO_ERROR
            },
        }
    }
}
