//! Benchmark command: poll the device's average trigger time.

use {
    super::Link,
    crate::{Cli, CliError, config::Config, was_interrupted},
    anyhow::Result,
    console::style,
    ecgsim::{
        BenchmarkConfig, BenchmarkPoller, BenchmarkSample, BenchmarkStats,
        benchmark::DEFAULT_INTERVAL,
    },
    std::{
        thread,
        time::{Duration, Instant, SystemTime, UNIX_EPOCH},
    },
};

/// How often new samples are printed.
const DISPLAY_POLL: Duration = Duration::from_millis(50);

/// Resolve the polling interval from flag, config or default.
pub(crate) fn benchmark_interval(flag: Option<f64>, config: &Config) -> Result<Duration> {
    match flag.or(config.benchmark.interval) {
        None => Ok(DEFAULT_INTERVAL),
        Some(secs) => Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|interval| !interval.is_zero())
            .ok_or_else(|| {
                CliError::Usage(format!(
                    "benchmark interval must be a positive number of seconds, got {secs}"
                ))
                .into()
            }),
    }
}

fn format_sample(sample: &BenchmarkSample, started: SystemTime) -> String {
    let offset = sample
        .timestamp
        .duration_since(started)
        .unwrap_or_default();
    format!("{:>9.2} s  {:>6} ms", offset.as_secs_f64(), sample.value_ms)
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Run a poller on a fresh connection until Ctrl-C, the deadline, or the
/// sample limit. Samples are printed to stdout as they arrive unless `json`.
pub(crate) fn poll_for(
    link: &Link,
    interval: Duration,
    duration: Option<Duration>,
    max_samples: Option<usize>,
    json: bool,
) -> Result<Vec<BenchmarkSample>> {
    let port = link.open()?;
    let config = BenchmarkConfig::with_interval(interval).with_max_samples(max_samples);
    let mut handle = BenchmarkPoller::new(port, config)?.spawn()?;
    let samples = handle.samples();

    let started = SystemTime::now();
    let deadline = duration.map(|d| Instant::now() + d);
    let mut printed = 0;
    let mut print_new = |all: &[BenchmarkSample]| {
        if !json {
            for sample in &all[printed..] {
                println!("{}", format_sample(sample, started));
            }
        }
        printed = all.len();
    };

    loop {
        print_new(&samples.snapshot());

        let timed_out = deadline.is_some_and(|deadline| Instant::now() >= deadline);
        if handle.is_finished() || timed_out || was_interrupted() {
            break;
        }
        thread::sleep(DISPLAY_POLL);
    }

    handle.stop();
    let all = samples.snapshot();
    print_new(&all);
    Ok(all)
}

/// Benchmark command implementation.
pub(crate) fn cmd_benchmark(
    cli: &Cli,
    config: &Config,
    interval: Option<f64>,
    count: Option<usize>,
    json: bool,
) -> Result<()> {
    let interval = benchmark_interval(interval, config)?;
    let link = Link::resolve(cli, config)?;

    if !cli.quiet && !json {
        eprintln!(
            "{} Polling {} every {:.2?} (Ctrl-C to stop)",
            style("⏱").cyan(),
            style(link.describe()).cyan(),
            interval
        );
    }

    let samples = poll_for(&link, interval, None, count, json)?;
    let stats = BenchmarkStats::from_samples(&samples);

    if json {
        let rows: Vec<serde_json::Value> = samples
            .iter()
            .map(|s| {
                serde_json::json!({
                    "timestamp_ms": unix_millis(s.timestamp),
                    "value_ms": s.value_ms,
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "interval_secs": interval.as_secs_f64(),
                "samples": rows,
                "stats": stats,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if !cli.quiet {
        match stats {
            Some(stats) => eprintln!(
                "\n{} {} samples: min {} ms, max {} ms, mean {:.1} ms, last {} ms",
                style("✓").green().bold(),
                stats.count,
                stats.min_ms,
                stats.max_ms,
                stats.mean_ms,
                stats.last_ms
            ),
            None => eprintln!("\n{} No samples recorded", style("⚠").yellow()),
        }
    }

    Ok(())
}
