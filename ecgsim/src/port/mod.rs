//! Transport abstraction for the serial link.
//!
//! The command/response engine never touches `serialport` directly. It talks
//! to a [`Port`], which gives it exactly what the protocol needs:
//!
//! - write a command's bytes,
//! - ask how many bytes are waiting,
//! - pop one byte without blocking,
//! - close the link (idempotent).
//!
//! ```text
//! +-------------------+     +-------------------+
//! |  Upload / Poller  |     |  Upload / Poller  |
//! +---------+---------+     +---------+---------+
//!           |                         |
//!           v                         v
//! +---------+---------+     +---------+---------+
//! |    Port Trait     |     |    Port Trait     |
//! +---------+---------+     +---------+---------+
//!           |                         |
//!           v                         v
//! +---------+---------+     +---------+---------+
//! |    NativePort     |     |      SimPort      |
//! |   (serialport)    |     | (FirmwareSim etc) |
//! +-------------------+     +-------------------+
//!        Hardware               Tests / --simulate
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use ecgsim::port::{NativePort, Port, SerialConfig};
//!
//! fn main() -> ecgsim::Result<()> {
//!     let mut port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
//!     port.write_all_bytes(b"GetFirmwareInfo\r")?;
//!     while let Some(byte) = port.read_byte()? {
//!         print!("{}", byte as char);
//!     }
//!     port.close()?;
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

pub mod sim;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Baud rate the device firmware's command line runs at.
pub const DEFAULT_BAUD: u32 = 115200;

/// Default per-connection response timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Default response timeout for this connection.
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
            baud_rate: DEFAULT_BAUD,
            timeout: DEFAULT_TIMEOUT,
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
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
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
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

/// A single exclusively-owned connection to the device.
///
/// Implementations must make [`Port::close`] idempotent, and every I/O method
/// must fail with [`Error::NotOpen`] once the port is closed.
pub trait Port: Read + Write + Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Default response timeout configured for this connection.
    fn timeout(&self) -> Duration;

    /// Whether the connection is still open.
    fn is_open(&self) -> bool;

    /// Number of received bytes waiting to be read. Never blocks.
    fn bytes_available(&mut self) -> Result<usize>;

    /// Discard anything buffered in either direction.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Close the port and release the OS resource.
    ///
    /// Calling this on an already-closed port does nothing.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes and flush.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotOpen);
        }
        Write::write_all(self, buf)?;
        Write::flush(self)?;
        Ok(())
    }

    /// Pop one received byte, or `None` when nothing is waiting.
    fn read_byte(&mut self) -> Result<Option<u8>> {
        if !self.is_open() {
            return Err(Error::NotOpen);
        }
        if self.bytes_available()? == 0 {
            return Ok(None);
        }

        let mut buf = [0u8; 1];
        match Read::read(self, &mut buf) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn baud_rate(&self) -> u32 {
        (**self).baud_rate()
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn bytes_available(&mut self) -> Result<usize> {
        (**self).bytes_available()
    }

    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write_all_bytes(buf)
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        (**self).read_byte()
    }
}

#[cfg(feature = "native")]
pub use native::NativePort;
pub use sim::{FirmwareSim, SimPort, SimResponder};
