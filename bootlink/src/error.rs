//! Error types for bootlink.

use thiserror::Error;

use crate::protocol::ymodem::TransferError;

/// Result type for bootlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bootlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Block transfer ended without completing.
    #[error("Block transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
