//! Serial port configuration and discovery.
//!
//! The protocol layer only ever sees a [`TimedByteChannel`]; this module
//! provides the configuration types and, with the `native` feature, a channel
//! backed by the `serialport` crate.
//!
//! ```text
//! +----------------------+   +----------------------+
//! | Endpoint (framed)    |   | YmodemReceiver       |
//! +----------+-----------+   +----------+-----------+
//!            |                          |
//!            v                          v
//! +----------+--------------------------+-----------+
//! |               TimedByteChannel                  |
//! +----------+--------------------------+-----------+
//!            |                          |
//!            v                          v
//! +----------+-----------+   +----------+-----------+
//! | NativePort           |   | UART driver / mocks  |
//! |   (serialport)       |   |   (integrator)       |
//! +----------------------+   +----------------------+
//! ```
//!
//! [`TimedByteChannel`]: crate::channel::TimedByteChannel

#[cfg(feature = "native")]
pub mod native;

use std::time::Duration;

use crate::error::{Error, Result};

/// Serial port configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Initial read/write timeout. Channel operations replace it per call.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(1),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = Error;

    fn try_from(bits: u8) -> Result<Self> {
        match bits {
            7 => Ok(Self::Seven),
            8 => Ok(Self::Eight),
            _ => Err(Error::Config(format!("unsupported data bits: {bits}"))),
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = Error;

    fn try_from(bits: u8) -> Result<Self> {
        match bits {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            _ => Err(Error::Config(format!("unsupported stop bits: {bits}"))),
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
}

/// Serial port information.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Product string (if available).
    pub product: Option<String>,
}

/// Trait for listing available serial ports.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
