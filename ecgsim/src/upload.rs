//! Waveform upload state machine.
//!
//! An upload is one attempt to stream a DAC code sequence into the device:
//!
//! ```text
//! Idle -> FirmwareInfoRequested -> FirmwareInfoAcked
//!      -> DownloadInitiated -> SampleLoop -> Completed
//!
//! any non-idle state --(missing/bad reply)--> Failed
//! ```
//!
//! There is no retry at any step. A sample that is not acknowledged aborts
//! the whole upload and the caller learns how many samples were confirmed.
//! What the device holds after a failed upload is undefined; start a new
//! upload from the firmware-info step.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ecgsim::port::{NativePort, SerialConfig};
//! use ecgsim::upload::{UploadConfig, UploadEvent, Uploader};
//! use ecgsim::waveform::ecg_codes;
//!
//! fn main() -> ecgsim::Result<()> {
//!     let codes = ecg_codes(60.0, 2.0)?;
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
//!
//!     let mut uploader = Uploader::new(port, UploadConfig::default());
//!     let report = uploader.upload(&codes, |event| {
//!         if let UploadEvent::Progress { sent, total } = event {
//!             println!("{sent}/{total}");
//!         }
//!     })?;
//!     println!("{} samples in {:?}", report.confirmed, report.elapsed);
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::framer::send_command;
use crate::protocol::{ACK_TOKEN, Command, contains_ack, read_response};
use crate::waveform::DacCode;

/// Pause after the firmware banner before initiating the download.
pub const SETTLE_AFTER_FIRMWARE_INFO: Duration = Duration::from_millis(300);

/// Pause after the download is accepted before the first sample.
pub const SETTLE_AFTER_INITIATE: Duration = Duration::from_millis(200);

/// How long each sample waits for its acknowledgement.
pub const SAMPLE_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Progress is logged every this many samples.
const PROGRESS_LOG_STEP: usize = 100;

/// Upload state.
///
/// `FirmwareInfoRequested` and `DownloadInitiated` are entered when their
/// command is written, so a failure reported in one of them names the step
/// whose reply was missing or wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UploadState {
    /// Nothing sent yet.
    Idle,
    /// `GetFirmwareInfo` written, waiting for the reply.
    FirmwareInfoRequested,
    /// Firmware banner accepted.
    FirmwareInfoAcked,
    /// `InitiateEcgDownload` written, waiting for the reply.
    DownloadInitiated,
    /// Streaming `DownloadEcgData` commands.
    SampleLoop,
    /// Every sample acknowledged.
    Completed,
    /// Aborted. Terminal.
    Failed,
}

impl UploadState {
    /// Whether no further transitions can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::FirmwareInfoRequested => "firmware info request",
            Self::FirmwareInfoAcked => "firmware info acknowledged",
            Self::DownloadInitiated => "download initiation",
            Self::SampleLoop => "sample loop",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// Something a caller can observe while an upload runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadEvent {
    /// The machine entered a new state.
    Step(UploadState),
    /// Sample `sent - 1` was acknowledged.
    Progress {
        /// Samples acknowledged so far.
        sent: usize,
        /// Samples in the upload.
        total: usize,
    },
}

/// Upload tuning.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Pause between the firmware-info step and the download initiation.
    pub settle_after_firmware_info: Duration,
    /// Pause between the download initiation and the first sample.
    pub settle_after_initiate: Duration,
    /// Acknowledgement deadline for each sample.
    pub sample_timeout: Duration,
    /// Accept any non-empty reply to `GetFirmwareInfo`.
    ///
    /// The shipped firmware answers with a banner and no `ok`.
    pub lenient_firmware_info: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            settle_after_firmware_info: SETTLE_AFTER_FIRMWARE_INFO,
            settle_after_initiate: SETTLE_AFTER_INITIATE,
            sample_timeout: SAMPLE_ACK_TIMEOUT,
            lenient_firmware_info: false,
        }
    }
}

impl UploadConfig {
    /// Set lenient firmware-info checking.
    #[must_use]
    pub fn with_lenient_firmware_info(mut self, lenient: bool) -> Self {
        self.lenient_firmware_info = lenient;
        self
    }

    /// Set both settle pauses.
    #[must_use]
    pub fn with_settle(mut self, after_firmware_info: Duration, after_initiate: Duration) -> Self {
        self.settle_after_firmware_info = after_firmware_info;
        self.settle_after_initiate = after_initiate;
        self
    }

    /// Set the per-sample acknowledgement deadline.
    #[must_use]
    pub fn with_sample_timeout(mut self, timeout: Duration) -> Self {
        self.sample_timeout = timeout;
        self
    }
}

/// Live view of the upload in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    /// Samples in the upload.
    pub total: usize,
    /// Index of the next sample to send; equals the confirmed count.
    pub current_index: usize,
    /// Last reply accepted as an acknowledgement.
    pub last_ack: Option<String>,
    /// Current state.
    pub state: UploadState,
}

impl UploadSession {
    fn new(total: usize) -> Self {
        Self {
            total,
            current_index: 0,
            last_ack: None,
            state: UploadState::Idle,
        }
    }
}

/// Outcome of a completed upload.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UploadReport {
    /// Samples in the upload.
    pub total: usize,
    /// Samples the device acknowledged.
    pub confirmed: usize,
    /// Wall time from the first command to the last acknowledgement.
    pub elapsed: Duration,
}

impl UploadReport {
    /// Acknowledged samples per second of wall time.
    pub fn samples_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.confirmed as f64 / secs
        } else {
            0.0
        }
    }
}

/// Runs uploads over one exclusively-owned port.
pub struct Uploader<P: Port> {
    port: P,
    config: UploadConfig,
    session: UploadSession,
}

impl<P: Port> Uploader<P> {
    /// Create an uploader for an open port.
    pub fn new(port: P, config: UploadConfig) -> Self {
        Self {
            port,
            config,
            session: UploadSession::new(0),
        }
    }

    /// State of the current or last upload.
    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Consume the uploader and return the underlying port, still open.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Stream `codes` to the device.
    ///
    /// `on_event` sees every state change and one `Progress` per acknowledged
    /// sample. Failures come back as [`Error::UploadFailed`].
    pub fn upload<F>(&mut self, codes: &[DacCode], mut on_event: F) -> Result<UploadReport>
    where
        F: FnMut(UploadEvent),
    {
        self.session = UploadSession::new(codes.len());
        let start = Instant::now();

        match self.run(codes, &mut on_event) {
            Ok(()) => {
                self.enter(UploadState::Completed, &mut on_event);
                let report = UploadReport {
                    total: codes.len(),
                    confirmed: self.session.current_index,
                    elapsed: start.elapsed(),
                };
                info!(
                    "Upload complete: {} samples in {:.2?} ({:.1} samples/s)",
                    report.total,
                    report.elapsed,
                    report.samples_per_second()
                );
                Ok(report)
            },
            Err(source) => {
                let state = self.session.state;
                self.enter(UploadState::Failed, &mut on_event);
                warn!(
                    "Upload failed during {state} after {}/{} samples",
                    self.session.current_index,
                    codes.len()
                );
                Err(Error::UploadFailed {
                    state,
                    confirmed: self.session.current_index,
                    total: codes.len(),
                    source: Box::new(source),
                })
            },
        }
    }

    fn run<F>(&mut self, codes: &[DacCode], on_event: &mut F) -> Result<()>
    where
        F: FnMut(UploadEvent),
    {
        let total = codes.len();

        self.enter(UploadState::FirmwareInfoRequested, on_event);
        self.request_firmware_info()?;
        self.enter(UploadState::FirmwareInfoAcked, on_event);
        thread::sleep(self.config.settle_after_firmware_info);

        self.enter(UploadState::DownloadInitiated, on_event);
        info!("Initiating download of {total} samples");
        let command = Command::InitiateEcgDownload { count: total };
        let timeout = self.port.timeout();
        self.transact(&command, timeout)?;
        thread::sleep(self.config.settle_after_initiate);

        self.enter(UploadState::SampleLoop, on_event);
        for (index, code) in codes.iter().enumerate() {
            let command = Command::DownloadEcgData {
                index,
                code: code.get(),
            };
            self.transact(&command, self.config.sample_timeout)?;

            self.session.current_index = index + 1;
            on_event(UploadEvent::Progress {
                sent: index + 1,
                total,
            });
            if (index + 1) % PROGRESS_LOG_STEP == 0 {
                debug!("Sent {}/{total} samples", index + 1);
            }
        }

        Ok(())
    }

    fn request_firmware_info(&mut self) -> Result<()> {
        info!("Requesting firmware info on {}", self.port.name());
        let command = Command::GetFirmwareInfo;
        send_command(&mut self.port, &command)?;

        let timeout = self.port.timeout();
        let response = read_response(&mut self.port, Some(ACK_TOKEN), timeout)?.ok_or_else(|| {
            Error::ProtocolTimeout {
                command: command.to_string(),
                waited: timeout,
            }
        })?;

        if !self.config.lenient_firmware_info && !contains_ack(&response) {
            return Err(Error::ProtocolMismatch {
                command: command.to_string(),
                expected: ACK_TOKEN.to_string(),
                response,
            });
        }

        info!("Firmware: {}", response.trim());
        self.session.last_ack = Some(response);
        Ok(())
    }

    /// Send `command` and require an acknowledgement within `max_wait`.
    fn transact(&mut self, command: &Command, max_wait: Duration) -> Result<()> {
        send_command(&mut self.port, command)?;

        match read_response(&mut self.port, Some(ACK_TOKEN), max_wait)? {
            Some(response) if contains_ack(&response) => {
                self.session.last_ack = Some(response);
                Ok(())
            },
            Some(response) => Err(Error::ProtocolMismatch {
                command: command.to_string(),
                expected: ACK_TOKEN.to_string(),
                response,
            }),
            None => Err(Error::ProtocolTimeout {
                command: command.to_string(),
                waited: max_wait,
            }),
        }
    }

    fn enter<F>(&mut self, state: UploadState, on_event: &mut F)
    where
        F: FnMut(UploadEvent),
    {
        debug!("Upload state: {} -> {state}", self.session.state);
        self.session.state = state;
        on_event(UploadEvent::Step(state));
    }
}

/// An upload running on its own thread.
pub struct UploadTask {
    events: Receiver<UploadEvent>,
    worker: JoinHandle<Result<UploadReport>>,
}

impl UploadTask {
    /// Progress stream. Ends when the worker finishes.
    pub fn events(&self) -> &Receiver<UploadEvent> {
        &self.events
    }

    /// Block until the upload ends and return its outcome.
    pub fn wait(self) -> Result<UploadReport> {
        self.worker
            .join()
            .unwrap_or_else(|_| Err(Error::Io(std::io::Error::other("upload worker panicked"))))
    }
}

/// Run an upload on a dedicated worker thread.
///
/// The worker owns `port` and closes it once the upload ends, whatever the
/// outcome.
pub fn start_upload<P>(port: P, codes: Vec<DacCode>, config: UploadConfig) -> Result<UploadTask>
where
    P: Port + 'static,
{
    let (tx, events) = mpsc::channel();

    let worker = thread::Builder::new()
        .name("ecgsim-upload".to_string())
        .spawn(move || {
            let mut uploader = Uploader::new(port, config);
            let result = uploader.upload(&codes, |event| {
                // A receiver that went away only loses progress updates
                let _ = tx.send(event);
            });

            let mut port = uploader.into_port();
            if let Err(e) = port.close() {
                warn!("Failed to close {}: {e}", port.name());
            }
            result
        })?;

    Ok(UploadTask { events, worker })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{FirmwareSim, SimPort};

    /// Route the uploader's log output through the test harness (`RUST_LOG=debug`).
    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn fast_config() -> UploadConfig {
        UploadConfig::default()
            .with_settle(Duration::ZERO, Duration::ZERO)
            .with_sample_timeout(Duration::from_millis(100))
    }

    fn acking_port(fw: &FirmwareSim) -> SimPort {
        fw.clone()
            .with_firmware_info_ack(true)
            .into_port("sim")
            .with_timeout(Duration::from_millis(200))
    }

    fn codes(values: &[u16]) -> Vec<DacCode> {
        values.iter().map(|v| DacCode::saturating(i64::from(*v))).collect()
    }

    #[test]
    fn test_full_upload_reports_every_sample() {
        let fw = FirmwareSim::new();
        let data = codes(&[2047, 0, 4095, 100, 2500]);
        let mut uploader = Uploader::new(acking_port(&fw), fast_config());

        let mut progress = Vec::new();
        let report = uploader
            .upload(&data, |event| {
                if let UploadEvent::Progress { sent, total } = event {
                    progress.push((sent, total));
                }
            })
            .unwrap();

        assert_eq!(progress, vec![(1, 5), (2, 5), (3, 5), (4, 5), (5, 5)]);
        assert_eq!(report.confirmed, 5);
        assert_eq!(report.total, 5);
        assert_eq!(fw.samples(), vec![2047, 0, 4095, 100, 2500]);
        assert_eq!(uploader.session().state, UploadState::Completed);
    }

    #[test]
    fn test_state_sequence() {
        let fw = FirmwareSim::new();
        let mut uploader = Uploader::new(acking_port(&fw), fast_config());

        let mut steps = Vec::new();
        uploader
            .upload(&codes(&[1]), |event| {
                if let UploadEvent::Step(state) = event {
                    steps.push(state);
                }
            })
            .unwrap();

        assert_eq!(
            steps,
            vec![
                UploadState::FirmwareInfoRequested,
                UploadState::FirmwareInfoAcked,
                UploadState::DownloadInitiated,
                UploadState::SampleLoop,
                UploadState::Completed,
            ]
        );
    }

    #[test]
    fn test_empty_upload_succeeds_without_samples() {
        let fw = FirmwareSim::new();
        let port = acking_port(&fw);
        let handle = port.handle();
        let mut uploader = Uploader::new(port, fast_config());

        let mut progress = 0;
        let report = uploader
            .upload(&[], |event| {
                if matches!(event, UploadEvent::Progress { .. }) {
                    progress += 1;
                }
            })
            .unwrap();

        assert_eq!(progress, 0);
        assert_eq!(report.confirmed, 0);
        assert_eq!(
            handle.commands(),
            vec!["GetFirmwareInfo", "InitiateEcgDownload 0"]
        );
    }

    #[test]
    fn test_missing_ack_aborts_at_that_sample() {
        init_logging();
        let fw = FirmwareSim::new().with_silent_sample(2);
        let port = acking_port(&fw);
        let handle = port.handle();
        let mut uploader = Uploader::new(port, fast_config());

        let err = uploader.upload(&codes(&[1, 2, 3, 4, 5]), |_| {}).unwrap_err();

        match &err {
            Error::UploadFailed {
                state,
                confirmed,
                total,
                source,
            } => {
                assert_eq!(*state, UploadState::SampleLoop);
                assert_eq!(*confirmed, 2);
                assert_eq!(*total, 5);
                assert!(matches!(**source, Error::ProtocolTimeout { .. }));
            },
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.confirmed_samples(), Some(2));
        assert_eq!(uploader.session().state, UploadState::Failed);

        let commands = handle.commands();
        assert_eq!(commands.last().map(String::as_str), Some("DownloadEcgData 2 3"));
        assert!(!commands.iter().any(|c| c.starts_with("DownloadEcgData 3 ")));
    }

    #[test]
    fn test_rejected_sample_aborts_with_mismatch() {
        init_logging();
        let fw = FirmwareSim::new().with_rejected_sample(3);
        let port = acking_port(&fw);
        let handle = port.handle();
        let mut uploader = Uploader::new(port, fast_config());

        let err = uploader.upload(&codes(&[1, 2, 3, 4, 5]), |_| {}).unwrap_err();

        match &err {
            Error::UploadFailed {
                state,
                confirmed,
                total,
                source,
            } => {
                assert_eq!(*state, UploadState::SampleLoop);
                assert_eq!(*confirmed, 3);
                assert_eq!(*total, 5);
                match &**source {
                    Error::ProtocolMismatch {
                        command, response, ..
                    } => {
                        assert_eq!(command, "DownloadEcgData 3 4");
                        assert!(response.contains("Command Bad"));
                    },
                    other => panic!("unexpected source: {other}"),
                }
            },
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fw.samples(), vec![1, 2, 3]);
        assert!(
            !handle
                .commands()
                .iter()
                .any(|c| c.starts_with("DownloadEcgData 4 "))
        );
    }

    #[test]
    fn test_first_sample_failure_confirms_nothing() {
        init_logging();
        for fw in [
            FirmwareSim::new().with_silent_sample(0),
            FirmwareSim::new().with_rejected_sample(0),
        ] {
            let port = acking_port(&fw);
            let handle = port.handle();
            let mut uploader = Uploader::new(port, fast_config());

            let mut progress = 0;
            let err = uploader
                .upload(&codes(&[7, 8]), |event| {
                    if matches!(event, UploadEvent::Progress { .. }) {
                        progress += 1;
                    }
                })
                .unwrap_err();

            assert!(matches!(
                err,
                Error::UploadFailed {
                    state: UploadState::SampleLoop,
                    confirmed: 0,
                    total: 2,
                    ..
                }
            ));
            assert_eq!(progress, 0);
            assert_eq!(uploader.session().current_index, 0);
            assert!(fw.samples().is_empty());
            assert_eq!(
                handle.commands().last().map(String::as_str),
                Some("DownloadEcgData 0 7")
            );
        }
    }

    #[test]
    fn test_rejected_download_size_fails_initiation() {
        let fw = FirmwareSim::new().with_capacity(2);
        let mut uploader = Uploader::new(acking_port(&fw), fast_config());

        let err = uploader.upload(&codes(&[1, 2, 3]), |_| {}).unwrap_err();
        match err {
            Error::UploadFailed {
                state,
                confirmed,
                source,
                ..
            } => {
                assert_eq!(state, UploadState::DownloadInitiated);
                assert_eq!(confirmed, 0);
                assert!(matches!(*source, Error::ProtocolMismatch { .. }));
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_banner_without_ack_is_rejected_unless_lenient() {
        let strict_port = FirmwareSim::new()
            .into_port("sim")
            .with_timeout(Duration::from_millis(100));
        let mut strict = Uploader::new(strict_port, fast_config());
        match strict.upload(&codes(&[1]), |_| {}).unwrap_err() {
            Error::UploadFailed { state, source, .. } => {
                assert_eq!(state, UploadState::FirmwareInfoRequested);
                assert!(matches!(*source, Error::ProtocolMismatch { .. }));
            },
            other => panic!("unexpected error: {other}"),
        }

        let fw = FirmwareSim::new();
        let lenient_port = fw
            .clone()
            .into_port("sim")
            .with_timeout(Duration::from_millis(100));
        let mut lenient = Uploader::new(lenient_port, fast_config().with_lenient_firmware_info(true));
        let report = lenient.upload(&codes(&[7, 8]), |_| {}).unwrap();
        assert_eq!(report.confirmed, 2);
        assert_eq!(fw.samples(), vec![7, 8]);
    }

    #[test]
    fn test_silent_device_times_out_on_first_step() {
        let port = SimPort::new("sim", |_: &str| None).with_timeout(Duration::from_millis(50));
        let mut uploader = Uploader::new(port, fast_config().with_lenient_firmware_info(true));

        match uploader.upload(&codes(&[1]), |_| {}).unwrap_err() {
            Error::UploadFailed { state, source, .. } => {
                assert_eq!(state, UploadState::FirmwareInfoRequested);
                assert!(matches!(*source, Error::ProtocolTimeout { .. }));
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_closed_port_fails_with_not_open() {
        let mut port = FirmwareSim::new().into_port("sim");
        port.close().unwrap();
        let mut uploader = Uploader::new(port, fast_config());

        match uploader.upload(&codes(&[1]), |_| {}).unwrap_err() {
            Error::UploadFailed { source, .. } => assert!(matches!(*source, Error::NotOpen)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_settle_pauses_are_observed() {
        let fw = FirmwareSim::new();
        let config = fast_config().with_settle(Duration::from_millis(60), Duration::from_millis(40));
        let mut uploader = Uploader::new(acking_port(&fw), config);

        let report = uploader.upload(&codes(&[1]), |_| {}).unwrap();
        assert!(report.elapsed >= Duration::from_millis(100));
    }

    #[test]
    fn test_background_upload_streams_events_and_closes_port() {
        let fw = FirmwareSim::new();
        let port = acking_port(&fw);
        let handle = port.handle();

        let task = start_upload(port, codes(&[10, 20, 30]), fast_config()).unwrap();
        let progress: Vec<(usize, usize)> = task
            .events()
            .iter()
            .filter_map(|event| match event {
                UploadEvent::Progress { sent, total } => Some((sent, total)),
                UploadEvent::Step(_) => None,
            })
            .collect();
        let report = task.wait().unwrap();

        assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(report.confirmed, 3);
        assert!(!handle.is_open());
    }

    #[test]
    fn test_report_rate() {
        let report = UploadReport {
            total: 10,
            confirmed: 10,
            elapsed: Duration::from_secs(2),
        };
        assert!((report.samples_per_second() - 5.0).abs() < f64::EPSILON);

        let instant = UploadReport {
            elapsed: Duration::ZERO,
            ..report
        };
        assert!(instant.samples_per_second().abs() < f64::EPSILON);
    }
}
