//! Background polling of the device's average trigger time.
//!
//! The poller owns its own connection and runs on its own thread. It shares
//! exactly two things with the rest of the program: a stop flag and the
//! [`SampleBuffer`] it appends to.
//!
//! ```text
//! loop until stopped:
//!     GetAvgTriggerTime\r  ->  "... Avg: <n> ms ..."  ->  push (now, n)
//!     sleep(interval)
//! ```
//!
//! Replies that do not carry a value are skipped. I/O errors are logged and
//! followed by a short back-off; the loop keeps going until asked to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::framer::send_command;
use crate::protocol::{Command, METRIC_TOKEN, parse_avg_trigger_time, read_response};

/// Default pause between queries.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// How long one query waits for its reply.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Pause after a failed iteration.
pub const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Longest uninterrupted sleep, so a stop request is noticed promptly.
const STOP_CHECK_SLICE: Duration = Duration::from_millis(20);

/// One average-trigger-time reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BenchmarkSample {
    /// When the reading was taken.
    pub timestamp: SystemTime,
    /// Average trigger time reported by the device, in milliseconds.
    pub value_ms: u64,
}

/// Append-only sample list shared between the poller and its readers.
///
/// Readers only ever get copies.
#[derive(Debug, Clone, Default)]
pub struct SampleBuffer {
    inner: Arc<Mutex<Vec<BenchmarkSample>>>,
}

impl SampleBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BenchmarkSample>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Append a sample.
    pub fn push(&self, sample: BenchmarkSample) {
        self.lock().push(sample);
    }

    /// Number of samples so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of every sample.
    pub fn snapshot(&self) -> Vec<BenchmarkSample> {
        self.lock().clone()
    }

    /// Copy of the samples at or after `cutoff`.
    pub fn since(&self, cutoff: SystemTime) -> Vec<BenchmarkSample> {
        self.lock()
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .copied()
            .collect()
    }

    /// Copy of the samples from the last `window`.
    pub fn recent(&self, window: Duration) -> Vec<BenchmarkSample> {
        let cutoff = SystemTime::now()
            .checked_sub(window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        self.since(cutoff)
    }

    /// Values only, in arrival order.
    pub fn values(&self) -> Vec<u64> {
        self.lock().iter().map(|s| s.value_ms).collect()
    }
}

/// Summary over a set of samples.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BenchmarkStats {
    /// Number of samples.
    pub count: usize,
    /// Smallest value.
    pub min_ms: u64,
    /// Largest value.
    pub max_ms: u64,
    /// Mean value.
    pub mean_ms: f64,
    /// Most recent value.
    pub last_ms: u64,
}

impl BenchmarkStats {
    /// Compute stats; `None` when there are no samples.
    pub fn from_samples(samples: &[BenchmarkSample]) -> Option<Self> {
        let last = samples.last()?;
        let sum: u64 = samples.iter().map(|s| s.value_ms).sum();
        Some(Self {
            count: samples.len(),
            min_ms: samples.iter().map(|s| s.value_ms).min()?,
            max_ms: samples.iter().map(|s| s.value_ms).max()?,
            mean_ms: sum as f64 / samples.len() as f64,
            last_ms: last.value_ms,
        })
    }
}

/// Poller tuning.
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    /// Pause between queries. Must be non-zero.
    pub interval: Duration,
    /// Reply deadline per query.
    pub response_timeout: Duration,
    /// Pause after an iteration that failed.
    pub error_backoff: Duration,
    /// Stop on its own after this many samples.
    pub max_samples: Option<usize>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            response_timeout: RESPONSE_TIMEOUT,
            error_backoff: ERROR_BACKOFF,
            max_samples: None,
        }
    }
}

impl BenchmarkConfig {
    /// Config with the given interval and defaults elsewhere.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    /// Set the sample limit.
    #[must_use]
    pub fn with_max_samples(mut self, max_samples: Option<usize>) -> Self {
        self.max_samples = max_samples;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::InvalidArgument(
                "benchmark interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Periodic `GetAvgTriggerTime` loop over one owned port.
pub struct BenchmarkPoller<P: Port> {
    port: P,
    config: BenchmarkConfig,
    samples: SampleBuffer,
    stop: Arc<AtomicBool>,
}

impl<P: Port> BenchmarkPoller<P> {
    /// Create a poller. Fails if the interval is zero.
    pub fn new(port: P, config: BenchmarkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            port,
            config,
            samples: SampleBuffer::new(),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Buffer the poller appends to.
    pub fn samples(&self) -> SampleBuffer {
        self.samples.clone()
    }

    /// Issue one query and record the value if the reply carries one.
    ///
    /// `Ok(None)` means no usable value: the device stayed silent or replied
    /// with something else.
    pub fn poll_once(&mut self) -> Result<Option<u64>> {
        send_command(&mut self.port, &Command::GetAvgTriggerTime)?;

        let Some(response) =
            read_response(&mut self.port, Some(METRIC_TOKEN), self.config.response_timeout)?
        else {
            return Ok(None);
        };

        match parse_avg_trigger_time(&response) {
            Ok(value_ms) => {
                trace!("Avg trigger time: {value_ms} ms");
                self.samples.push(BenchmarkSample {
                    timestamp: SystemTime::now(),
                    value_ms,
                });
                Ok(Some(value_ms))
            },
            Err(e) => {
                debug!("Skipping reply: {e}");
                Ok(None)
            },
        }
    }

    /// Run until the stop flag is set or the sample limit is reached, then
    /// close the port.
    pub fn run(mut self) {
        info!("Benchmark polling {} every {:?}", self.port.name(), self.config.interval);

        while !self.stopped() {
            match self.poll_once() {
                Ok(_) => {
                    if self
                        .config
                        .max_samples
                        .is_some_and(|max| self.samples.len() >= max)
                    {
                        debug!("Sample limit reached");
                        break;
                    }
                    self.sleep(self.config.interval);
                },
                Err(e) => {
                    warn!("Benchmark error: {e}");
                    self.sleep(self.config.error_backoff);
                },
            }
        }

        if let Err(e) = self.port.close() {
            warn!("Failed to close {}: {e}", self.port.name());
        }
        info!("Benchmark stopped after {} samples", self.samples.len());
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(STOP_CHECK_SLICE));
        }
    }
}

impl<P: Port + 'static> BenchmarkPoller<P> {
    /// Move the poller onto its own thread.
    pub fn spawn(self) -> Result<BenchmarkHandle> {
        let stop = Arc::clone(&self.stop);
        let samples = self.samples.clone();

        let worker = thread::Builder::new()
            .name("ecgsim-benchmark".to_string())
            .spawn(move || self.run())?;

        Ok(BenchmarkHandle {
            stop,
            samples,
            worker: Some(worker),
        })
    }
}

/// Control handle for a running poller.
///
/// Dropping the handle stops the poller as well.
pub struct BenchmarkHandle {
    stop: Arc<AtomicBool>,
    samples: SampleBuffer,
    worker: Option<JoinHandle<()>>,
}

impl BenchmarkHandle {
    /// Shared sample buffer.
    pub fn samples(&self) -> SampleBuffer {
        self.samples.clone()
    }

    /// Whether the worker has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Ask the poller to stop and wait for it to close its port.
    ///
    /// A query in flight finishes first, so this can take up to the reply
    /// timeout plus one sleep slice.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Benchmark worker panicked");
            }
        }
    }
}

impl Drop for BenchmarkHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open a fresh native connection and start polling on it.
///
/// Open failures are returned before any thread starts.
#[cfg(feature = "native")]
pub fn start_native(
    serial: &crate::port::SerialConfig,
    config: BenchmarkConfig,
) -> Result<BenchmarkHandle> {
    config.validate()?;
    let port = crate::port::NativePort::open(serial)?;
    BenchmarkPoller::new(port, config)?.spawn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{FirmwareSim, SimPort};
    use std::collections::VecDeque;

    fn fast_config() -> BenchmarkConfig {
        BenchmarkConfig {
            interval: Duration::from_millis(10),
            response_timeout: Duration::from_millis(50),
            error_backoff: Duration::from_millis(50),
            max_samples: None,
        }
    }

    fn scripted(replies: &[&str]) -> SimPort {
        let mut script: VecDeque<String> = replies.iter().map(ToString::to_string).collect();
        SimPort::new("bench", move |_: &str| script.pop_front())
    }

    fn wait_for(mut cond: impl FnMut() -> bool, limit: Duration) {
        let deadline = Instant::now() + limit;
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = BenchmarkConfig::with_interval(Duration::ZERO);
        let port = FirmwareSim::new().into_port("bench");
        assert!(matches!(
            BenchmarkPoller::new(port, config),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_poll_once_records_value() {
        let port = FirmwareSim::new().with_trigger_times([42]).into_port("bench");
        let mut poller = BenchmarkPoller::new(port, fast_config()).unwrap();

        assert_eq!(poller.poll_once().unwrap(), Some(42));
        assert_eq!(poller.samples().values(), vec![42]);
    }

    #[test]
    fn test_unmatched_replies_are_dropped() {
        let port = scripted(&["Avg: 12 ms\n", "garbage", "Avg: 7 ms\n"]);
        let handle = BenchmarkPoller::new(port, fast_config()).unwrap().spawn().unwrap();
        let samples = handle.samples();

        wait_for(|| samples.len() >= 2, Duration::from_secs(2));
        // Give the poller time to pick up anything beyond the script
        thread::sleep(Duration::from_millis(100));
        drop(handle);

        assert_eq!(samples.values(), vec![12, 7]);
    }

    #[test]
    fn test_stop_closes_port_and_freezes_buffer() {
        let port = FirmwareSim::new().into_port("bench");
        let sim = port.handle();
        let mut handle = BenchmarkPoller::new(port, fast_config()).unwrap().spawn().unwrap();
        let samples = handle.samples();

        wait_for(|| samples.len() >= 3, Duration::from_secs(2));
        let config = fast_config();
        let started = Instant::now();
        handle.stop();
        assert!(started.elapsed() < config.interval + config.response_timeout + Duration::from_millis(200));

        assert!(!sim.is_open());
        assert!(handle.is_finished());
        let frozen = samples.len();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(samples.len(), frozen);
        assert!(frozen >= 3);
    }

    #[test]
    fn test_errors_back_off_and_keep_running() {
        let mut port = FirmwareSim::new().into_port("bench");
        port.close().unwrap();
        let mut handle = BenchmarkPoller::new(port, fast_config()).unwrap().spawn().unwrap();

        thread::sleep(Duration::from_millis(120));
        assert!(!handle.is_finished());
        assert!(handle.samples().is_empty());
        handle.stop();
        assert!(handle.is_finished());
    }

    #[test]
    fn test_max_samples_stops_poller() {
        let port = FirmwareSim::new().with_trigger_times([1, 2, 3, 4, 5]).into_port("bench");
        let sim = port.handle();
        let config = fast_config().with_max_samples(Some(3));
        let handle = BenchmarkPoller::new(port, config).unwrap().spawn().unwrap();

        wait_for(|| handle.is_finished(), Duration::from_secs(2));
        assert!(handle.is_finished());
        assert_eq!(handle.samples().values(), vec![1, 2, 3]);
        assert!(!sim.is_open());
    }

    #[test]
    fn test_buffer_windowing_and_stats() {
        let buffer = SampleBuffer::new();
        let now = SystemTime::now();
        let old = now - Duration::from_secs(10);
        buffer.push(BenchmarkSample { timestamp: old, value_ms: 900 });
        buffer.push(BenchmarkSample { timestamp: now, value_ms: 1000 });
        buffer.push(BenchmarkSample { timestamp: now, value_ms: 1100 });

        assert_eq!(buffer.since(now - Duration::from_secs(5)).len(), 2);
        assert_eq!(buffer.recent(Duration::from_secs(5)).len(), 2);

        let stats = BenchmarkStats::from_samples(&buffer.snapshot()).unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min_ms, 900);
        assert_eq!(stats.max_ms, 1100);
        assert_eq!(stats.last_ms, 1100);
        assert!((stats.mean_ms - 1000.0).abs() < f64::EPSILON);
        assert_eq!(BenchmarkStats::from_samples(&[]), None);
    }
}
