//! # bootlink
//!
//! Firmware-update protocol endpoint for device bootloaders.
//!
//! This crate provides the device side of two update protocols spoken over a
//! byte-oriented serial link:
//!
//! - A framed request/response protocol (node info, device management,
//!   bootloader status, image data chunks) on top of an injected frame codec
//! - An XMODEM/YMODEM block-transfer receiver
//!
//! Both run over a [`TimedByteChannel`], a byte channel whose operations
//! return within a bounded time and tell timeouts apart from failures.
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport` crate
//! - Anything else that implements [`TimedByteChannel`]
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use bootlink::{WriterSink, YmodemReceiver};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let config = bootlink::SerialConfig::new("/dev/ttyUSB0", 115200);
//!         let mut port = bootlink::NativePort::open(&config)?;
//!         let mut sink = WriterSink::new(std::fs::File::create("image.bin")?);
//!
//!         let summary = YmodemReceiver::new(&mut port).receive(&mut sink, |done, total| {
//!             println!("{done} / {total:?} bytes");
//!         })?;
//!         println!("Received {} blocks", summary.blocks);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod channel;
pub mod endpoint;
pub mod error;
pub mod port;
pub mod protocol;
pub mod sink;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). It is the default
/// cancellation source of [`YmodemReceiver`] and of [`endpoint::Platform`].
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    channel::{ChannelError, ChannelResult, IO_BYTE_TIMEOUT, IoChannel, TimedByteChannel},
    endpoint::{
        AppInfo, BootloaderController, ControllerView, Endpoint, EndpointConfig, ImageDownloader,
        MIN_WATCHDOG_TIMEOUT, Platform,
    },
    error::{Error, Result},
    port::{PortEnumerator, PortInfo, SerialConfig},
    protocol::{
        Frame, FrameCodec, ParserOutput, TransferError, TransferSummary, YmodemConfig,
        YmodemReceiver,
    },
    sink::{DownloadSink, WriterSink},
};
