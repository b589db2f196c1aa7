//! Upload command: synthesize, stream with acknowledgement, optionally poll.

use {
    super::{
        Link,
        benchmark::{benchmark_interval, poll_for},
        preview::synthesize,
    },
    crate::{Cli, CliError, WaveformArgs, config::Config, use_fancy_output, was_interrupted},
    anyhow::{Context, Result},
    console::style,
    ecgsim::{Error, UploadConfig, UploadEvent, UploadState, start_upload},
    indicatif::{ProgressBar, ProgressStyle},
    std::{sync::mpsc::RecvTimeoutError, time::Duration},
};

/// How often the progress loop checks for Ctrl-C.
const EVENT_POLL: Duration = Duration::from_millis(100);

/// Progress bar in percent, hidden when quiet or not on a terminal.
fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

fn step_message(state: UploadState) -> String {
    match state {
        UploadState::SampleLoop => "sending samples".to_string(),
        other => other.to_string(),
    }
}

const ABORTED: &str = "Upload aborted; the device state is undefined, start a new upload";

/// Context attached to a failed upload.
///
/// Stock firmware never acknowledges its banner, so a strict check that sees
/// the banner without `ok` points at the flag that accepts it.
fn failure_context(err: &Error, lenient: bool) -> String {
    match err {
        Error::UploadFailed {
            state: UploadState::FirmwareInfoRequested,
            source,
            ..
        } if !lenient && matches!(**source, Error::ProtocolMismatch { .. }) => format!(
            "{ABORTED} (the firmware banner carried no acknowledgement; \
             retry with --lenient-firmware-info)"
        ),
        _ => ABORTED.to_string(),
    }
}

/// Upload command implementation.
pub(crate) fn cmd_upload(
    cli: &Cli,
    config: &Config,
    args: &WaveformArgs,
    lenient_firmware_info: bool,
    resume_benchmark: Option<f64>,
) -> Result<()> {
    let synthesized = synthesize(args, config)?;
    let total = synthesized.codes.len();

    let link = Link::resolve(cli, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Using {}",
            style("🔌").cyan(),
            style(link.describe()).cyan()
        );
        eprintln!(
            "{} Uploading {total} samples ({:?}, {:.1} bpm, {:.3} V peak-to-peak)",
            style("📈").cyan(),
            args.waveform,
            synthesized.heart_rate,
            synthesized.pp_voltage
        );
    }

    let port = link.open()?;
    let lenient = lenient_firmware_info || config.upload.lenient_firmware_info;
    let upload_config = UploadConfig::default().with_lenient_firmware_info(lenient);
    let task = start_upload(port, synthesized.codes, upload_config)?;

    let pb = progress_bar(cli.quiet);
    loop {
        match task.events().recv_timeout(EVENT_POLL) {
            Ok(UploadEvent::Step(state)) => pb.set_message(step_message(state)),
            Ok(UploadEvent::Progress { sent, total }) => {
                if total > 0 {
                    pb.set_position((sent * 100 / total) as u64);
                }
            },
            Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if was_interrupted() {
            pb.abandon_with_message("cancelled");
            return Err(CliError::Cancelled(
                "upload interrupted; the device state is undefined, start a new upload".to_string(),
            )
            .into());
        }
    }

    let report = match task.wait() {
        Ok(report) => {
            pb.finish_with_message("complete");
            report
        },
        Err(e) => {
            pb.abandon_with_message("failed");
            let context = failure_context(&e, lenient);
            return Err(e).context(context);
        },
    };

    if !cli.quiet {
        eprintln!(
            "\n{} Uploaded {} samples in {:.2?} ({:.0} samples/s)",
            style("✓").green().bold(),
            report.confirmed,
            report.elapsed,
            report.samples_per_second()
        );
    }

    if let Some(secs) = resume_benchmark {
        if !cli.quiet {
            eprintln!(
                "{} Resuming benchmark for {secs} s",
                style("⏱").cyan()
            );
        }
        let interval = benchmark_interval(None, config)?;
        let duration = Duration::try_from_secs_f64(secs)
            .map_err(|e| CliError::Usage(format!("invalid --resume-benchmark {secs}: {e}")))?;
        poll_for(&link, interval, Some(duration), None, false)?;
    }

    Ok(())
}
