//! Waveform synthesis and conversion to 12-bit DAC codes.
//!
//! The device drives an MCP4725 (12 bit, 3.3 V reference) whose output goes
//! through a 10 kΩ / 10 Ω divider to the electrodes. Everything here is pure
//! data: the upload engine only ever sees the resulting `&[DacCode]`.
//!
//! The usual pipeline for one loop of the simulator:
//!
//! 1. synthesize two beats ([`EcgSynth`], or [`sine_fallback`]),
//! 2. keep the middle half ([`isolate_middle`]),
//! 3. flatten the baseline so the loop seam is invisible
//!    ([`remove_linear_drift`]),
//! 4. scale to codes ([`to_dac_codes`]).
//!
//! [`ecg_codes`] runs all four.

use std::f64::consts::PI;
use std::fmt;

use crate::error::{Error, Result};

/// DAC reference voltage.
pub const DAC_VREF: f64 = 3.3;

/// Largest 12-bit code.
pub const DAC_MAX: u16 = 4095;

/// Code for the midpoint of the output range.
pub const DAC_MID: u16 = DAC_MAX / 2;

/// Divider between DAC output and electrodes (10 Ω over 10 kΩ + 10 Ω).
pub const DIVIDER_RATIO: f64 = 10.0 / (10_000.0 + 10.0);

/// Sample rate the firmware plays waveforms back at.
pub const PLAYBACK_RATE_HZ: f64 = 1000.0;

/// Heart rates at or below this do not fit two beats in device memory.
pub const MIN_HEART_RATE: f64 = 30.0;

/// Spans below this are treated as a flat signal.
const FLAT_SPAN: f64 = 1e-12;

/// A 12-bit DAC output level, always within `0..=4095`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "u16", into = "u16")
)]
pub struct DacCode(u16);

impl DacCode {
    /// Lowest output level.
    pub const MIN: Self = Self(0);
    /// Midpoint, the idle level of a centred waveform.
    pub const MID: Self = Self(DAC_MID);
    /// Highest output level.
    pub const MAX: Self = Self(DAC_MAX);

    /// Checked constructor.
    pub fn new(value: u16) -> Option<Self> {
        (value <= DAC_MAX).then_some(Self(value))
    }

    /// Clamp any integer into range.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn saturating(value: i64) -> Self {
        Self(value.clamp(0, i64::from(DAC_MAX)) as u16)
    }

    /// Clamp a real-valued level into range, then truncate toward zero.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_level(level: f64) -> Self {
        Self(level.clamp(0.0, f64::from(DAC_MAX)) as u16)
    }

    /// Raw code.
    pub fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for DacCode {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        Self::new(value)
            .ok_or_else(|| Error::InvalidArgument(format!("DAC code {value} exceeds {DAC_MAX}")))
    }
}

impl From<DacCode> for u16 {
    fn from(code: DacCode) -> Self {
        code.0
    }
}

impl fmt::Display for DacCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// DAC peak-to-peak voltage that yields `mv_pp` millivolts at the electrodes.
///
/// 3 mV needs about 3 V from the DAC.
pub fn mv_pp_to_dac_volts(mv_pp: f64) -> f64 {
    mv_pp * 1e-3 / DIVIDER_RATIO
}

/// Code swing either side of [`DAC_MID`] for a peak-to-peak DAC voltage.
pub fn half_swing(pp_volts: f64) -> f64 {
    (pp_volts / DAC_VREF) * f64::from(DAC_MAX) / 2.0
}

/// Subtract the straight line joining the first and last sample, keeping the
/// first sample's level. Afterwards both ends sit at the same value.
///
/// Fewer than two samples are returned unchanged.
pub fn remove_linear_drift(samples: &[f64]) -> Vec<f64> {
    let n = samples.len();
    if n < 2 {
        return samples.to_vec();
    }

    let start = samples[0];
    let end = samples[n - 1];
    let step = (end - start) / (n - 1) as f64;

    samples
        .iter()
        .enumerate()
        .map(|(i, value)| value - (start + step * i as f64) + start)
        .collect()
}

/// Normalize `samples` to [-1, 1] and scale them around the mid code.
///
/// A flat input maps to all [`DacCode::MID`]. Peak-to-peak voltages above the
/// reference clip at the rails.
pub fn to_dac_codes(samples: &[f64], pp_volts: f64) -> Result<Vec<DacCode>> {
    if !pp_volts.is_finite() || pp_volts <= 0.0 {
        return Err(Error::InvalidArgument(format!(
            "peak-to-peak voltage must be positive, got {pp_volts}"
        )));
    }

    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;

    if span.is_nan() || span < FLAT_SPAN {
        return Ok(vec![DacCode::MID; samples.len()]);
    }

    let swing = half_swing(pp_volts);
    Ok(samples
        .iter()
        .map(|value| {
            let norm = 2.0 * (value - min) / span - 1.0;
            DacCode::from_level(f64::from(DAC_MID) + norm * swing)
        })
        .collect())
}

/// Keep the middle half of a trace, dropping a quarter at each end.
///
/// Traces shorter than four samples come back whole.
pub fn isolate_middle(samples: &[f64]) -> Vec<f64> {
    let quarter = samples.len() / 4;
    if quarter == 0 {
        return samples.to_vec();
    }
    samples[quarter..samples.len() - quarter].to_vec()
}

/// `0.2 · sin(2π · hr/60 · t)` sampled at `fs`, for when no model is wanted.
pub fn sine_fallback(heart_rate: f64, fs: f64, len: usize) -> Vec<f64> {
    (0..len)
        .map(|i| {
            let t = i as f64 / fs;
            0.2 * (2.0 * PI * heart_rate / 60.0 * t).sin()
        })
        .collect()
}

/// Number of samples the two-beat synthesis produces at `heart_rate`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn two_beat_len(heart_rate: f64) -> usize {
    (2.0 * PLAYBACK_RATE_HZ * (60.0 / heart_rate)) as usize
}

/// Which synthesized shape to turn into codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shape {
    /// ECGSYN dynamical model.
    #[default]
    Ecg,
    /// Plain sine at the heart rate.
    Sine,
}

fn check_heart_rate(heart_rate: f64) -> Result<()> {
    if heart_rate.is_finite() && heart_rate > MIN_HEART_RATE {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "heart rate must be above {MIN_HEART_RATE} bpm, got {heart_rate}"
        )))
    }
}

/// One simulator loop of codes for `heart_rate`, `pp_volts` peak to peak.
pub fn ecg_codes(heart_rate: f64, pp_volts: f64) -> Result<Vec<DacCode>> {
    shape_codes(Shape::Ecg, heart_rate, pp_volts)
}

/// Like [`ecg_codes`] with a choice of [`Shape`].
pub fn shape_codes(shape: Shape, heart_rate: f64, pp_volts: f64) -> Result<Vec<DacCode>> {
    check_heart_rate(heart_rate)?;

    let len = two_beat_len(heart_rate);
    let trace = match shape {
        Shape::Ecg => {
            EcgSynth::new(EcgConfig {
                fs: PLAYBACK_RATE_HZ,
                heart_rate,
                noise: 0.0,
            })?
            .generate(len)
            .samples
        },
        Shape::Sine => sine_fallback(heart_rate, PLAYBACK_RATE_HZ, len),
    };

    let middle = isolate_middle(&trace);
    to_dac_codes(&remove_linear_drift(&middle), pp_volts)
}

/// Square pulse parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseConfig {
    /// Samples per second.
    pub sampling_rate: f64,
    /// Length of the generated sequence.
    pub duration_secs: f64,
    /// Pulse repetition rate.
    pub frequency_hz: f64,
    /// Fraction of each period spent high.
    pub duty_cycle: f64,
    /// High level, in DAC output millivolts.
    pub amplitude_mv: f64,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            sampling_rate: PLAYBACK_RATE_HZ,
            duration_secs: 1.0,
            frequency_hz: 1.0,
            duty_cycle: 0.1,
            amplitude_mv: 3.0,
        }
    }
}

/// Square pulse train straight to codes; low is code 0.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn pulse_codes(config: &PulseConfig) -> Result<Vec<DacCode>> {
    let PulseConfig {
        sampling_rate,
        duration_secs,
        frequency_hz,
        duty_cycle,
        amplitude_mv,
    } = *config;

    let positive = |v: f64| v.is_finite() && v > 0.0;
    if !positive(sampling_rate) || !positive(duration_secs) || !positive(frequency_hz) {
        return Err(Error::InvalidArgument(
            "pulse rate, duration and frequency must be positive".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&duty_cycle) {
        return Err(Error::InvalidArgument(format!(
            "duty cycle must be within 0..=1, got {duty_cycle}"
        )));
    }

    let num_samples = (sampling_rate * duration_secs) as usize;
    let period = ((sampling_rate / frequency_hz) as usize).max(1);
    let high_samples = (period as f64 * duty_cycle) as usize;

    let high = DacCode::from_level(amplitude_mv * 1e-3 / DAC_VREF * f64::from(DAC_MAX));

    Ok((0..num_samples)
        .map(|i| if i % period < high_samples { high } else { DacCode::MIN })
        .collect())
}

// ECGSYN morphology: P, Q, R, S, T as (angle, amplitude, width)
const WAVE_ANGLES: [f64; 5] = [
    -60.0 * PI / 180.0,
    -15.0 * PI / 180.0,
    0.0,
    15.0 * PI / 180.0,
    90.0 * PI / 180.0,
];
const WAVE_AMPLITUDES: [f64; 5] = [1.2, -5.0, 30.0, -7.5, 0.75];
const WAVE_WIDTHS: [f64; 5] = [0.25, 0.1, 0.1, 0.1, 0.4];

/// ECGSYN parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EcgConfig {
    /// Sampling rate in Hz.
    pub fs: f64,
    /// Heart rate in beats per minute.
    pub heart_rate: f64,
    /// Uniform noise amplitude added to each sample; 0 disables it.
    pub noise: f64,
}

impl Default for EcgConfig {
    fn default() -> Self {
        Self {
            fs: PLAYBACK_RATE_HZ,
            heart_rate: 60.0,
            noise: 0.0,
        }
    }
}

/// Synthesized trace plus the sample indices where an R wave was crossed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EcgTrace {
    /// Signal, arbitrary units (roughly mV).
    pub samples: Vec<f64>,
    /// Indices of detected R peaks.
    pub r_peaks: Vec<usize>,
}

/// ECGSYN three-variable model (McSharry et al.), integrated with RK4.
///
/// A point circles the unit limit cycle in the x-y plane once per beat. The
/// z derivative is a sum of Gaussian-weighted terms at the P, Q, R, S and T
/// angles minus a pull back to the zero baseline, so z traces one positive
/// or negative wave per event:
///
/// ```text
/// z' = -sum(a_i * dθ_i * exp(-dθ_i² / 2b_i²)) - z
/// ```
///
/// Respiratory baseline wander is left out; uploads remove linear drift
/// anyway.
#[derive(Debug, Clone)]
pub struct EcgSynth {
    config: EcgConfig,
    rng_state: u32,
}

impl EcgSynth {
    /// Create a synthesizer. Rate and heart rate must be positive.
    pub fn new(config: EcgConfig) -> Result<Self> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(config.fs) || !positive(config.heart_rate) {
            return Err(Error::InvalidArgument(format!(
                "ECG model needs positive fs and heart rate, got {} Hz / {} bpm",
                config.fs, config.heart_rate
            )));
        }
        Ok(Self {
            config,
            rng_state: 1,
        })
    }

    /// Samples in one beat.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn samples_per_beat(&self) -> usize {
        (60.0 / self.config.heart_rate * self.config.fs) as usize
    }

    /// Generate whole beats.
    pub fn generate_beats(&mut self, beats: usize) -> EcgTrace {
        self.generate(beats * self.samples_per_beat())
    }

    /// Generate `len` samples starting from the model's rest state.
    pub fn generate(&mut self, len: usize) -> EcgTrace {
        let rr = 60.0 / self.config.heart_rate;
        let w = 2.0 * PI / rr;
        let h = 1.0 / self.config.fs;

        let mut x: [f64; 3] = [1.0, 0.0, 0.04];
        let mut prev_theta = x[1].atan2(x[0]);
        let mut trace = EcgTrace {
            samples: Vec::with_capacity(len),
            r_peaks: Vec::new(),
        };

        for i in 0..len {
            rk4_step(&mut x, h, w);

            let mut z = x[2];
            if self.config.noise > 0.0 {
                z += self.config.noise * (2.0 * self.next_uniform() - 1.0);
            }
            trace.samples.push(z);

            let theta = x[1].atan2(x[0]);
            if prev_theta < 0.0 && theta >= 0.0 {
                trace.r_peaks.push(i);
            }
            prev_theta = theta;
        }

        trace
    }

    /// Uniform in [0, 1) from a 32-bit LCG.
    fn next_uniform(&mut self) -> f64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(1_664_525)
            .wrapping_add(1_013_904_223);
        f64::from((self.rng_state >> 8) & 0x00FF_FFFF) / 16_777_216.0
    }
}

fn derivative(x: &[f64; 3], w: f64) -> [f64; 3] {
    let a = 1.0 - x[0].hypot(x[1]);
    let theta = x[1].atan2(x[0]);

    let waves: f64 = (0..5)
        .map(|i| {
            let mut dt = theta - WAVE_ANGLES[i];
            if dt > PI {
                dt -= 2.0 * PI;
            }
            if dt < -PI {
                dt += 2.0 * PI;
            }
            let b = WAVE_WIDTHS[i];
            -WAVE_AMPLITUDES[i] * dt * (-0.5 * dt * dt / (b * b)).exp()
        })
        .sum();

    [
        a * x[0] - w * x[1],
        a * x[1] + w * x[0],
        waves - x[2],
    ]
}

fn rk4_step(x: &mut [f64; 3], h: f64, w: f64) {
    let offset = |base: &[f64; 3], k: &[f64; 3], scale: f64| {
        [
            base[0] + scale * k[0],
            base[1] + scale * k[1],
            base[2] + scale * k[2],
        ]
    };

    let k1 = derivative(x, w);
    let k2 = derivative(&offset(x, &k1, 0.5 * h), w);
    let k3 = derivative(&offset(x, &k2, 0.5 * h), w);
    let k4 = derivative(&offset(x, &k3, h), w);

    for i in 0..3 {
        x[i] += h / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]);
    }
}

/// Summary of a code sequence, for previews.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CodeStats {
    /// Number of codes.
    pub len: usize,
    /// Smallest code.
    pub min: u16,
    /// Largest code.
    pub max: u16,
    /// Mean code.
    pub mean: f64,
}

impl CodeStats {
    /// Compute stats; `None` for an empty sequence.
    pub fn of(codes: &[DacCode]) -> Option<Self> {
        let min = codes.iter().min()?.get();
        let max = codes.iter().max()?.get();
        let sum: u64 = codes.iter().map(|c| u64::from(c.get())).sum();
        Some(Self {
            len: codes.len(),
            min,
            max,
            mean: sum as f64 / codes.len() as f64,
        })
    }

    /// Peak-to-peak DAC output voltage the codes span.
    pub fn pp_volts(&self) -> f64 {
        f64::from(self.max - self.min) / f64::from(DAC_MAX) * DAC_VREF
    }
}
