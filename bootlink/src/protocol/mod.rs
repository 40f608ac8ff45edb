//! Protocol implementations.

pub mod crc;
pub mod frame;
pub mod messages;
pub mod ymodem;

// Re-export common types
pub use frame::{Frame, FrameCodec, ParserOutput, STANDARD_FRAME_TYPE_CODE};
pub use messages::{
    BootloaderState, BootloaderStatus, CommandStatus, DeviceManagementCommand, ImageData,
    ImageType, NodeInfo, Request, Response,
};
pub use ymodem::{TransferError, TransferSummary, YmodemConfig, YmodemReceiver};
