//! # ecgsim
//!
//! Host-side engine for the ECGSim prototype ECG simulator.
//!
//! The simulator board replays a waveform held in RAM through a 12-bit DAC.
//! This crate drives it over its serial command line:
//!
//! - a [`Port`] abstraction over the serial link, with a native
//!   implementation and an in-memory firmware simulator,
//! - token-or-timeout response framing ([`protocol::read_response`]),
//! - the waveform upload state machine ([`upload`]),
//! - a background poller for the average trigger time ([`benchmark`]),
//! - waveform synthesis and DAC code conversion ([`waveform`]),
//! - serial port discovery ([`device`]).
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `serde`: serialization support for reports and samples
//!
//! ## Example
//!
//! ```rust,no_run
//! use ecgsim::{NativePort, SerialConfig, UploadConfig, Uploader, ecg_codes};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let codes = ecg_codes(72.0, 2.0)?;
//!
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyACM0", 115200))?;
//!     let mut uploader = Uploader::new(port, UploadConfig::default());
//!     uploader.upload(&codes, |event| println!("{event:?}"))?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod benchmark;
pub mod device;
pub mod error;
pub mod port;
pub mod protocol;
pub mod upload;
pub mod waveform;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use benchmark::start_native;
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    benchmark::{
        BenchmarkConfig, BenchmarkHandle, BenchmarkPoller, BenchmarkSample, BenchmarkStats,
        SampleBuffer,
    },
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports, format_port_list},
    error::{Error, Result},
    port::{FirmwareSim, Port, SerialConfig, SimPort},
    protocol::{Command, read_response},
    upload::{
        UploadConfig, UploadEvent, UploadReport, UploadState, UploadTask, Uploader, start_upload,
    },
    waveform::{DacCode, PulseConfig, Shape, ecg_codes, pulse_codes, to_dac_codes},
};
