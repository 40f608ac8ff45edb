//! Native serial port channel using the `serialport` crate.

use {
    crate::{
        channel::{ChannelError, ChannelResult, TimedByteChannel},
        error::{Error, Result},
        port::{DataBits, FlowControl, Parity, PortEnumerator, PortInfo, SerialConfig, StopBits},
    },
    log::{debug, trace},
    serialport::ClearBuffer,
    std::{
        io::{self, Read, Write},
        time::Duration,
    },
};

/// Serial port exposed as a [`TimedByteChannel`].
pub struct NativePort {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    timeout: Duration,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(config.data_bits.into())
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .flow_control(config.flow_control.into())
            .open()?;

        debug!(
            "Opened {} at {} baud",
            config.port_name, config.baud_rate
        );

        Ok(Self {
            port,
            name: config.port_name.clone(),
            timeout: config.timeout,
        })
    }

    /// Get the port name/path.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Discard anything pending in the input and output buffers.
    pub fn clear_buffers(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn apply_timeout(&mut self, timeout: Duration) -> ChannelResult<()> {
        if timeout != self.timeout {
            self.port.set_timeout(timeout).map_err(|e| {
                trace!("set_timeout failed on {}: {e}", self.name);
                ChannelError::Failed
            })?;
            self.timeout = timeout;
        }
        Ok(())
    }
}

fn classify(err: &io::Error) -> ChannelError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
            ChannelError::Timeout
        },
        _ => ChannelError::Failed,
    }
}

impl TimedByteChannel for NativePort {
    fn emit(&mut self, byte: u8, timeout: Duration) -> ChannelResult<()> {
        self.apply_timeout(timeout)?;
        match self.port.write(&[byte]) {
            Ok(1) => Ok(()),
            Ok(_) => Err(ChannelError::Timeout),
            Err(e) => Err(classify(&e)),
        }
    }

    fn receive(&mut self, timeout: Duration) -> ChannelResult<u8> {
        self.apply_timeout(timeout)?;
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Ok(buf[0]),
            Ok(_) => Err(ChannelError::Timeout),
            Err(e) => Err(classify(&e)),
        }
    }
}

/// Native port enumerator.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let (vid, pid, product) = match &p.port_type {
                    serialport::SerialPortType::UsbPort(info) => {
                        (Some(info.vid), Some(info.pid), info.product.clone())
                    },
                    _ => (None, None, None),
                };

                PortInfo {
                    name: p.port_name,
                    vid,
                    pid,
                    product,
                }
            })
            .collect())
    }
}

// Type conversions from our types to serialport types

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Hardware => Self::Hardware,
        }
    }
}
