//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod benchmark;
pub(crate) mod completions;
pub(crate) mod ports;
pub(crate) mod preview;
pub(crate) mod upload;

use {
    crate::{
        Cli,
        config::Config,
        serial::{SerialOptions, select_serial_port},
    },
    anyhow::Result,
    ecgsim::{
        FirmwareSim, NativePort, Port, SerialConfig,
        port::{DEFAULT_BAUD, DEFAULT_TIMEOUT},
    },
    log::info,
    std::time::Duration,
};

/// Heart rate used when neither flag nor config sets one.
pub(crate) const DEFAULT_HEART_RATE: f64 = 60.0;

/// DAC peak-to-peak voltage used when neither flag nor config sets one.
pub(crate) const DEFAULT_PP_VOLTAGE: f64 = 2.0;

/// Port name reported by the simulated device.
const SIMULATED_PORT_NAME: &str = "simulated";

/// The device a command talks to.
pub(crate) enum Link {
    /// A real serial port.
    Serial(SerialConfig),
    /// The in-memory firmware; every connection shares its state.
    Simulated {
        /// Shared firmware state.
        firmware: FirmwareSim,
        /// Default response timeout for each connection.
        timeout: Duration,
    },
}

impl Link {
    /// Resolve flags, environment and config into a link.
    pub(crate) fn resolve(cli: &Cli, config: &Config) -> Result<Self> {
        let timeout = cli
            .timeout_ms
            .or(config.connection.timeout_ms)
            .map_or(DEFAULT_TIMEOUT, Duration::from_millis);

        if cli.simulate {
            info!("Using the simulated device");
            return Ok(Self::Simulated {
                firmware: FirmwareSim::new(),
                timeout,
            });
        }

        let options = SerialOptions {
            port: cli.port.clone(),
            non_interactive: cli.non_interactive,
        };
        let port = select_serial_port(&options, config)?;
        let baud = cli.baud.or(config.connection.baud).unwrap_or(DEFAULT_BAUD);

        Ok(Self::Serial(
            SerialConfig::new(port, baud).with_timeout(timeout),
        ))
    }

    /// Human-readable target description.
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Serial(serial) => format!("{} @ {} baud", serial.port_name, serial.baud_rate),
            Self::Simulated { .. } => "simulated device".to_string(),
        }
    }

    /// Open a fresh connection.
    pub(crate) fn open(&self) -> Result<Box<dyn Port>> {
        match self {
            Self::Serial(serial) => Ok(Box::new(NativePort::open(serial)?)),
            Self::Simulated { firmware, timeout } => Ok(Box::new(
                firmware
                    .clone()
                    .into_port(SIMULATED_PORT_NAME)
                    .with_timeout(*timeout),
            )),
        }
    }
}
