//! Platform hooks injected into the endpoint.

use crate::channel::TimedByteChannel;
use crate::protocol::frame::Frame;
use crate::protocol::messages::{CommandStatus, DeviceManagementCommand};

/// Everything the endpoint needs from the board it runs on.
///
/// The byte channel is part of the platform. Hooks with a sensible default
/// may be left unimplemented.
pub trait Platform: TimedByteChannel {
    /// A frame the endpoint does not understand.
    fn process_unhandled_frame(&mut self, frame: &Frame) {
        let _ = frame;
    }

    /// Bytes that were not part of any frame.
    fn process_extraneous_data(&mut self, data: &[u8]) {
        let _ = data;
    }

    /// A device management command other than `LaunchBootloader`.
    fn process_unhandled_command(&mut self, command: DeviceManagementCommand) -> CommandStatus;

    /// Atomically store the certificate of authenticity and read it back.
    ///
    /// `data` is shorter than 255 bytes. Returns the number of bytes written
    /// into `read_back` or a negative error code. Platforms without CoA
    /// storage keep the default, which reads back nothing.
    fn write_and_read_back_coa(&mut self, data: &[u8], read_back: &mut [u8]) -> i16 {
        let _ = (data, read_back);
        0
    }

    /// Liveness hook, called at least once per loop iteration.
    ///
    /// External watchdogs must not be configured below
    /// [`MIN_WATCHDOG_TIMEOUT`](super::MIN_WATCHDOG_TIMEOUT).
    fn reset_watchdog(&mut self) {}

    /// Whether the endpoint should stop.
    fn should_exit(&self) -> bool {
        crate::is_interrupted_requested()
    }
}
