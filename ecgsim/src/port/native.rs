//! [`Port`] over the `serialport` crate for Linux, macOS and Windows.

use {
    crate::{
        error::{Error, Result},
        port::{DataBits, FlowControl, Parity, Port, SerialConfig, StopBits},
    },
    log::{debug, trace},
    serialport::{ClearBuffer, SerialPort},
    std::{
        io::{self, Read, Write},
        time::Duration,
    },
};

/// A serial connection to the simulator board.
///
/// Closing drops the OS handle; the value stays usable as a closed port.
pub struct NativePort {
    handle: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

impl NativePort {
    /// Open `config.port_name` with the configured line settings.
    ///
    /// Any failure (absent device, busy, permission denied) is reported as
    /// [`Error::Connection`].
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let handle = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(config.data_bits.into())
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .flow_control(config.flow_control.into())
            .open()
            .map_err(|e| Error::Connection {
                port: config.port_name.clone(),
                source: e.into(),
            })?;

        debug!(
            "Opened {} at {} baud, response timeout {:?}",
            config.port_name, config.baud_rate, config.timeout
        );

        Ok(Self {
            handle: Some(handle),
            name: config.port_name.clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    fn handle(&mut self) -> Result<&mut (dyn SerialPort + 'static)> {
        self.handle.as_deref_mut().ok_or(Error::NotOpen)
    }

    fn io_handle(&mut self) -> io::Result<&mut (dyn SerialPort + 'static)> {
        let name = &self.name;
        self.handle
            .as_deref_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, format!("{name} is closed")))
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn bytes_available(&mut self) -> Result<usize> {
        let waiting = self.handle()?.bytes_to_read()?;
        Ok(usize::try_from(waiting).unwrap_or(usize::MAX))
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.handle()?.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.handle.take().is_some() {
            trace!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.io_handle()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.io_handle()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.io_handle()?.flush()
    }
}

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
            FlowControl::Software => Self::Software,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_port_is_connection_error() {
        let config = SerialConfig::new("/dev/ecgsim-does-not-exist", 115200);
        match NativePort::open(&config) {
            Err(err @ Error::Connection { .. }) => {
                assert!(err.is_connection_error());
                assert!(err.to_string().contains("/dev/ecgsim-does-not-exist"));
            },
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opening a missing port must fail"),
        }
    }

    #[test]
    fn test_line_settings_map_to_serialport() {
        let config = SerialConfig::default();
        assert_eq!(
            serialport::DataBits::from(config.data_bits),
            serialport::DataBits::Eight
        );
        assert_eq!(serialport::Parity::from(config.parity), serialport::Parity::None);
        assert_eq!(serialport::StopBits::from(config.stop_bits), serialport::StopBits::One);
        assert_eq!(
            serialport::FlowControl::from(FlowControl::Software),
            serialport::FlowControl::Software
        );
    }
}
