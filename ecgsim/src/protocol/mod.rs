//! The ECGSim text command protocol.
//!
//! Every command is ASCII, space separated and terminated by a single `\r`.
//! Replies are free text. The host only ever looks for a token inside them:
//!
//! | Command                         | Host waits for         |
//! |---------------------------------|------------------------|
//! | `GetFirmwareInfo`               | `ok`                   |
//! | `InitiateEcgDownload <count>`   | `ok`                   |
//! | `DownloadEcgData <index> <code>`| `ok` (case-insensitive)|
//! | `GetAvgTriggerTime`             | `ms`, then `Avg: N ms` |

pub mod framer;

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

pub use framer::{POLL_INTERVAL, read_response, read_response_default};

/// Command terminator.
pub const TERMINATOR: char = '\r';

/// Acknowledgement token for download commands.
pub const ACK_TOKEN: &str = "ok";

/// Token that ends a `GetAvgTriggerTime` reply.
pub const METRIC_TOKEN: &str = "ms";

/// A command understood by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Ask for the firmware banner.
    GetFirmwareInfo,
    /// Announce how many samples follow.
    InitiateEcgDownload {
        /// Number of samples in the upload.
        count: usize,
    },
    /// Store one DAC code at an index.
    DownloadEcgData {
        /// Zero-based sample index.
        index: usize,
        /// 12-bit DAC code.
        code: u16,
    },
    /// Ask for the running average trigger interval.
    GetAvgTriggerTime,
}

impl Command {
    /// Command name as the firmware's dispatcher knows it.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetFirmwareInfo => "GetFirmwareInfo",
            Self::InitiateEcgDownload { .. } => "InitiateEcgDownload",
            Self::DownloadEcgData { .. } => "DownloadEcgData",
            Self::GetAvgTriggerTime => "GetAvgTriggerTime",
        }
    }

    /// Wire bytes, terminator included.
    pub fn encode(&self) -> Vec<u8> {
        let mut line = self.to_string();
        line.push(TERMINATOR);
        line.into_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitiateEcgDownload { count } => write!(f, "{} {count}", self.name()),
            Self::DownloadEcgData { index, code } => write!(f, "{} {index} {code}", self.name()),
            _ => f.write_str(self.name()),
        }
    }
}

/// Whether a reply acknowledges a download command.
///
/// Matches `ok` anywhere in the text, ignoring case.
pub fn contains_ack(response: &str) -> bool {
    response.to_ascii_lowercase().contains(ACK_TOKEN)
}

static METRIC_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Avg:\s*(\d+)\s*ms").expect("invalid metric regex"));

/// Extract the millisecond value from a `GetAvgTriggerTime` reply.
///
/// The first `Avg: <digits> ms` occurrence wins; surrounding text is ignored.
pub fn parse_avg_trigger_time(response: &str) -> Result<u64> {
    METRIC_REGEX
        .captures(response)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .ok_or_else(|| Error::MalformedMetric(response.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encoding() {
        assert_eq!(Command::GetFirmwareInfo.encode(), b"GetFirmwareInfo\r");
        assert_eq!(
            Command::InitiateEcgDownload { count: 1000 }.encode(),
            b"InitiateEcgDownload 1000\r"
        );
        assert_eq!(
            Command::DownloadEcgData { index: 0, code: 2047 }.encode(),
            b"DownloadEcgData 0 2047\r"
        );
        assert_eq!(Command::GetAvgTriggerTime.encode(), b"GetAvgTriggerTime\r");
    }

    #[test]
    fn test_contains_ack_is_case_insensitive() {
        assert!(contains_ack("\nok"));
        assert!(contains_ack("OK\r\n"));
        assert!(contains_ack("sample stored, Ok"));
        assert!(!contains_ack("Command Bad\n"));
        assert!(!contains_ack(""));
    }

    #[test]
    fn test_parse_avg_trigger_time() {
        assert_eq!(parse_avg_trigger_time("Avg: 12 ms").unwrap(), 12);
        assert_eq!(parse_avg_trigger_time("\r\nAvg:857ms\r\n").unwrap(), 857);
        assert_eq!(parse_avg_trigger_time("noise Avg:   3   ms trailing").unwrap(), 3);
        assert_eq!(parse_avg_trigger_time("Avg: 1 ms Avg: 2 ms").unwrap(), 1);
    }

    #[test]
    fn test_parse_avg_trigger_time_rejects_garbage() {
        for reply in ["garbage ms", "Avg: ms", "Avg: -4 ms", "avg: 5 ms", ""] {
            assert!(
                matches!(parse_avg_trigger_time(reply), Err(Error::MalformedMetric(_))),
                "{reply:?} should be rejected"
            );
        }
    }
}
