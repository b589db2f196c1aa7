//! In-memory ports that answer the ECGSim command line without hardware.
//!
//! [`SimPort`] buffers what the host writes, cuts it into `\r`-terminated
//! commands and hands each one to a [`SimResponder`]. Replies become readable
//! after an optional latency, byte by byte, exactly like a UART receive
//! buffer.
//!
//! [`FirmwareSim`] is a responder that behaves like the device firmware's
//! command table (`GetFirmwareInfo`, `InitiateEcgDownload`,
//! `DownloadEcgData`, `GetAvgTriggerTime`), with fault injection for tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::trace;

use crate::error::{Error, Result};
use crate::port::{DEFAULT_BAUD, DEFAULT_TIMEOUT, Port};
use crate::waveform::DAC_MAX;

/// Something that answers complete commands written to a [`SimPort`].
pub trait SimResponder: Send {
    /// Reply to one command (terminator stripped). `None` means silence.
    fn respond(&mut self, command: &str) -> Option<String>;
}

impl<F> SimResponder for F
where
    F: FnMut(&str) -> Option<String> + Send,
{
    fn respond(&mut self, command: &str) -> Option<String> {
        self(command)
    }
}

struct SimState {
    open: bool,
    line: Vec<u8>,
    rx: VecDeque<u8>,
    pending: VecDeque<(Instant, Vec<u8>)>,
    commands: Vec<String>,
    responder: Box<dyn SimResponder>,
    latency: Duration,
}

impl SimState {
    fn promote_ready(&mut self) {
        let now = Instant::now();
        while self
            .pending
            .front()
            .is_some_and(|(ready_at, _)| *ready_at <= now)
        {
            if let Some((_, bytes)) = self.pending.pop_front() {
                self.rx.extend(bytes);
            }
        }
    }
}

/// An in-memory [`Port`] driven by a [`SimResponder`].
pub struct SimPort {
    name: String,
    baud_rate: u32,
    timeout: Duration,
    state: Arc<Mutex<SimState>>,
}

/// Observer for a [`SimPort`] that stays usable after the port moved into a
/// worker thread.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    // A panicking test thread must not hide the port state from the others
    state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl SimPort {
    /// Create an open simulated port.
    pub fn new(name: impl Into<String>, responder: impl SimResponder + 'static) -> Self {
        Self {
            name: name.into(),
            baud_rate: DEFAULT_BAUD,
            timeout: DEFAULT_TIMEOUT,
            state: Arc::new(Mutex::new(SimState {
                open: true,
                line: Vec::new(),
                rx: VecDeque::new(),
                pending: VecDeque::new(),
                commands: Vec::new(),
                responder: Box::new(responder),
                latency: Duration::ZERO,
            })),
        }
    }

    /// Set the default response timeout reported by [`Port::timeout`].
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay every reply by `latency`.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        lock(&self.state).latency = latency;
        self
    }

    /// Get an observer handle.
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl SimHandle {
    /// Commands written so far, terminators stripped, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Whether the port is still open.
    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    /// Make bytes readable immediately, as if the device sent them unprompted.
    pub fn inject(&self, bytes: &[u8]) {
        lock(&self.state).rx.extend(bytes.iter().copied());
    }
}

impl Port for SimPort {
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
        lock(&self.state).open
    }

    fn bytes_available(&mut self) -> Result<usize> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(Error::NotOpen);
        }
        state.promote_ready();
        Ok(state.rx.len())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(Error::NotOpen);
        }
        state.rx.clear();
        state.pending.clear();
        state.line.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        lock(&self.state).open = false;
        Ok(())
    }
}

impl Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        state.promote_ready();
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }

        for &byte in buf {
            if byte != b'\r' {
                state.line.push(byte);
                continue;
            }

            let command = String::from_utf8_lossy(&state.line).into_owned();
            state.line.clear();
            trace!("sim <- {command:?}");

            let reply = state.responder.respond(&command);
            state.commands.push(command);

            if let Some(reply) = reply {
                trace!("sim -> {reply:?}");
                let ready_at = Instant::now() + state.latency;
                state.pending.push_back((ready_at, reply.into_bytes()));
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Acknowledgement the firmware prints after a good download command.
const FIRMWARE_ACK: &str = "\nok";

/// Banner printed in answer to `GetFirmwareInfo`.
pub const FIRMWARE_BANNER: &str = "\nECGSIM Protoype V0.1";

/// Samples the firmware can hold.
pub const FIRMWARE_CAPACITY: usize = 2000;

#[derive(Debug, Default)]
struct FirmwareState {
    capacity: usize,
    ack_firmware_info: bool,
    download_size: Option<usize>,
    samples: Vec<u16>,
    silent_sample: Option<usize>,
    rejected_sample: Option<usize>,
    trigger_times: VecDeque<u64>,
}

/// Responder emulating the device firmware's command line.
///
/// Cloning shares state, so a test can keep one clone for inspection while
/// the other lives inside a [`SimPort`].
#[derive(Clone)]
pub struct FirmwareSim {
    state: Arc<Mutex<FirmwareState>>,
}

impl Default for FirmwareSim {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareSim {
    /// Firmware with the stock capacity and no injected faults.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FirmwareState {
                capacity: FIRMWARE_CAPACITY,
                ..FirmwareState::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, FirmwareState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Append `"\nok"` to the firmware banner.
    ///
    /// The shipped firmware does not, which is why uploads against it need
    /// lenient firmware-info checking.
    #[must_use]
    pub fn with_firmware_info_ack(self, ack: bool) -> Self {
        self.state().ack_firmware_info = ack;
        self
    }

    /// Change the number of samples the firmware accepts.
    #[must_use]
    pub fn with_capacity(self, capacity: usize) -> Self {
        self.state().capacity = capacity;
        self
    }

    /// Stay silent when sample `index` arrives.
    #[must_use]
    pub fn with_silent_sample(self, index: usize) -> Self {
        self.state().silent_sample = Some(index);
        self
    }

    /// Answer `Command Bad` when sample `index` arrives.
    #[must_use]
    pub fn with_rejected_sample(self, index: usize) -> Self {
        self.state().rejected_sample = Some(index);
        self
    }

    /// Answer `GetAvgTriggerTime` with these values, in order.
    ///
    /// Once exhausted the firmware reports the loaded waveform period.
    #[must_use]
    pub fn with_trigger_times(self, times: impl IntoIterator<Item = u64>) -> Self {
        self.state().trigger_times = times.into_iter().collect();
        self
    }

    /// Wrap this firmware in a [`SimPort`].
    pub fn into_port(self, name: impl Into<String>) -> SimPort {
        SimPort::new(name, self)
    }

    /// Codes stored by `DownloadEcgData` so far.
    pub fn samples(&self) -> Vec<u16> {
        self.state().samples.clone()
    }

    /// Size announced by the last accepted `InitiateEcgDownload`.
    pub fn download_size(&self) -> Option<usize> {
        self.state().download_size
    }

    fn initiate(state: &mut FirmwareState, args: &[&str]) -> String {
        if args.len() < 2 {
            return "Insufficient number of arguments\n".to_string();
        }
        match args[1].parse::<usize>() {
            Ok(size) if size <= state.capacity => {
                state.download_size = Some(size);
                state.samples = Vec::with_capacity(size);
                FIRMWARE_ACK.to_string()
            },
            _ => "Command Bad\n".to_string(),
        }
    }

    fn download(state: &mut FirmwareState, args: &[&str]) -> Option<String> {
        if args.len() < 3 {
            return Some("Insufficient number of arguments\n".to_string());
        }
        let index = args[1].parse::<usize>().ok();
        let code = args[2]
            .parse::<u16>()
            .ok()
            .filter(|code| *code <= DAC_MAX);

        if index.is_some() && index == state.silent_sample {
            return None;
        }
        if index.is_some() && index == state.rejected_sample {
            return Some("Command Bad\n".to_string());
        }

        match (state.download_size, index, code) {
            (Some(size), Some(index), Some(code)) if index < size => {
                if index < state.samples.len() {
                    state.samples[index] = code;
                } else {
                    state.samples.resize(index, crate::waveform::DAC_MID);
                    state.samples.push(code);
                }
                Some(FIRMWARE_ACK.to_string())
            },
            _ => Some("Command Bad\n".to_string()),
        }
    }

    fn avg_trigger_time(state: &mut FirmwareState) -> String {
        // One sample per millisecond, so a loaded beat's period is its length
        let value = state
            .trigger_times
            .pop_front()
            .or_else(|| state.download_size.map(|size| size as u64))
            .unwrap_or(0);
        format!("Avg: {value} ms\n")
    }
}

impl SimResponder for FirmwareSim {
    fn respond(&mut self, command: &str) -> Option<String> {
        let args: Vec<&str> = command.split(' ').filter(|a| !a.is_empty()).collect();
        let name = *args.first()?;
        let mut state = self.state();

        match name {
            "GetFirmwareInfo" => {
                let mut reply = FIRMWARE_BANNER.to_string();
                if state.ack_firmware_info {
                    reply.push_str(FIRMWARE_ACK);
                }
                Some(reply)
            },
            "InitiateEcgDownload" => Some(Self::initiate(&mut state, &args)),
            "DownloadEcgData" => Self::download(&mut state, &args),
            "GetAvgTriggerTime" => Some(Self::avg_trigger_time(&mut state)),
            _ => Some("Command not found\n".to_string()),
        }
    }
}
