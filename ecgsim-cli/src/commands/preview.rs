//! Waveform synthesis and the `preview` command.

use {
    super::{DEFAULT_HEART_RATE, DEFAULT_PP_VOLTAGE},
    crate::{CliError, Waveform, WaveformArgs, config::Config},
    anyhow::{Context, Result},
    console::style,
    ecgsim::{
        DacCode, PulseConfig, Shape, pulse_codes,
        port::sim::FIRMWARE_CAPACITY,
        waveform::{CodeStats, MIN_HEART_RATE, PLAYBACK_RATE_HZ, mv_pp_to_dac_volts, shape_codes},
    },
    log::warn,
};

/// Codes for the requested waveform plus the parameters that produced them.
#[derive(Debug)]
pub(crate) struct Synthesized {
    /// DAC codes in playback order.
    pub codes: Vec<DacCode>,
    /// Heart rate used (not meaningful for pulses).
    pub heart_rate: f64,
    /// DAC peak-to-peak voltage used (not meaningful for pulses).
    pub pp_voltage: f64,
}

/// Build the code sequence for `args`, falling back to config then defaults.
pub(crate) fn synthesize(args: &WaveformArgs, config: &Config) -> Result<Synthesized> {
    let heart_rate = args
        .heart_rate
        .or(config.upload.heart_rate)
        .unwrap_or(DEFAULT_HEART_RATE);
    if heart_rate.is_nan() || heart_rate <= MIN_HEART_RATE {
        return Err(CliError::Usage(format!(
            "heart rate must be above {MIN_HEART_RATE} bpm, got {heart_rate}"
        ))
        .into());
    }

    let pp_voltage = match args.target_mv {
        Some(mv) => mv_pp_to_dac_volts(mv),
        None => args
            .pp_voltage
            .or(config.upload.pp_voltage)
            .unwrap_or(DEFAULT_PP_VOLTAGE),
    };

    let codes = match args.waveform {
        Waveform::Ecg => shape_codes(Shape::Ecg, heart_rate, pp_voltage),
        Waveform::Sine => shape_codes(Shape::Sine, heart_rate, pp_voltage),
        Waveform::Pulse => pulse_codes(&PulseConfig {
            sampling_rate: PLAYBACK_RATE_HZ,
            duration_secs: args.pulse_duration,
            frequency_hz: args.pulse_frequency,
            duty_cycle: args.duty_cycle,
            amplitude_mv: args.pulse_amplitude_mv,
        }),
    }
    .context("Failed to synthesize waveform")?;

    if codes.len() > FIRMWARE_CAPACITY {
        warn!(
            "{} samples exceed the simulator's {FIRMWARE_CAPACITY}-sample buffer; the device will reject the download",
            codes.len()
        );
    }

    Ok(Synthesized {
        codes,
        heart_rate,
        pp_voltage,
    })
}

/// Preview command implementation.
pub(crate) fn cmd_preview(
    config: &Config,
    args: &WaveformArgs,
    print_codes: bool,
    json: bool,
) -> Result<()> {
    let synthesized = synthesize(args, config)?;
    let stats = CodeStats::of(&synthesized.codes);

    if json {
        let codes: Option<Vec<u16>> =
            print_codes.then(|| synthesized.codes.iter().map(|c| c.get()).collect());
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "waveform": format!("{:?}", args.waveform).to_lowercase(),
                "heart_rate": synthesized.heart_rate,
                "pp_voltage": synthesized.pp_voltage,
                "samples": synthesized.codes.len(),
                "stats": stats,
                "codes": codes,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Waveform preview").bold().underlined());
    eprintln!(
        "  {} {:?} at {:.1} bpm, {:.3} V peak-to-peak",
        style("•").green(),
        args.waveform,
        synthesized.heart_rate,
        synthesized.pp_voltage
    );
    match stats {
        Some(stats) => {
            eprintln!(
                "  {} {} samples ({:.2} s at {PLAYBACK_RATE_HZ} Hz)",
                style("•").green(),
                stats.len,
                stats.len as f64 / PLAYBACK_RATE_HZ
            );
            eprintln!(
                "  {} codes {}..={} (mean {:.1}), {:.3} V span",
                style("•").green(),
                stats.min,
                stats.max,
                stats.mean,
                stats.pp_volts()
            );
        },
        None => eprintln!("  {}", style("no samples").dim()),
    }

    if print_codes {
        for code in &synthesized.codes {
            println!("{code}");
        }
    }

    Ok(())
}
