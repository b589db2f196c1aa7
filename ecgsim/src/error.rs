//! Error types for ecgsim.

use crate::upload::UploadState;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for ecgsim operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ecgsim operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on an open connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The serial port could not be opened (absent, busy, or permission denied).
    #[error("Cannot open {port}: {source}")]
    Connection {
        /// Port name that failed to open.
        port: String,
        /// Underlying cause.
        #[source]
        source: io::Error,
    },

    /// Operation attempted on a closed connection.
    #[error("Connection is not open")]
    NotOpen,

    /// Nothing at all was received before the deadline.
    #[error("No response to {command} within {waited:?}")]
    ProtocolTimeout {
        /// Command that went unanswered.
        command: String,
        /// How long the framer waited.
        waited: Duration,
    },

    /// A reply arrived but did not contain the expected token.
    #[error("Unexpected response to {command}: expected '{expected}', got {response:?}")]
    ProtocolMismatch {
        /// Command that was sent.
        command: String,
        /// Token the reply should have contained.
        expected: String,
        /// What the device actually sent.
        response: String,
    },

    /// Benchmark reply without an `Avg: <n> ms` payload.
    #[error("Malformed metric response: {0:?}")]
    MalformedMetric(String),

    /// An upload stopped before every sample was acknowledged.
    ///
    /// The device is left mid-sequence; a new upload must start again from
    /// the firmware-info step.
    #[error("Upload failed during {state} after {confirmed}/{total} samples: {source}")]
    UploadFailed {
        /// State the machine was in when the step failed.
        state: UploadState,
        /// Number of samples the device acknowledged.
        confirmed: usize,
        /// Number of samples in the upload.
        total: usize,
        /// Step-level cause.
        #[source]
        source: Box<Error>,
    },

    /// A runtime parameter is out of range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No serial port could be found.
    #[error("No serial device found")]
    DeviceNotFound,
}

impl Error {
    /// Number of acknowledged samples for an upload failure, `None` otherwise.
    pub fn confirmed_samples(&self) -> Option<usize> {
        match self {
            Self::UploadFailed { confirmed, .. } => Some(*confirmed),
            _ => None,
        }
    }

    /// Whether the error means the port could not be reached at all.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::DeviceNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_failed_message_names_state_and_progress() {
        let err = Error::UploadFailed {
            state: UploadState::SampleLoop,
            confirmed: 3,
            total: 10,
            source: Box::new(Error::ProtocolTimeout {
                command: "DownloadEcgData 3 2047".to_string(),
                waited: Duration::from_secs(1),
            }),
        };
        let text = err.to_string();
        assert!(text.contains("3/10"));
        assert!(text.contains("sample loop"));
        assert_eq!(err.confirmed_samples(), Some(3));
    }

    #[test]
    fn test_connection_error_classification() {
        let err = Error::Connection {
            port: "/dev/ttyUSB9".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such device"),
        };
        assert!(err.is_connection_error());
        assert!(!Error::NotOpen.is_connection_error());
        assert_eq!(Error::NotOpen.confirmed_samples(), None);
    }
}
