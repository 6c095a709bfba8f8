//! Byte transport under the servo bus.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("read timed out after {0} of {1} bytes")]
    ShortRead(usize, usize),
}

/// Half-duplex byte pipe to the servo bus.
pub trait Transport: Send {
    /// Write all of `data`.
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `buf.len()` bytes or fail with
    /// [`TransportError::ShortRead`].
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Drop any stale bytes waiting in the input buffer.
    fn clear_input(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// `serialport`-backed UART transport (8N1, no flow control).
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open `path` (e.g. `/dev/ttyUSB0`) at `baud_rate`.
    pub fn open(path: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(read_timeout)
            .open()?;
        info!(path, baud_rate, "opened servo bus serial port");
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => return Err(TransportError::ShortRead(filled, buf.len())),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(TransportError::ShortRead(filled, buf.len()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}
