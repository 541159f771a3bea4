//! CLI entrypoint for pingmux.

use clap::{Parser, ValueEnum};
use pingmux_common::{
    CancellationToken, DEFAULT_INTERVAL_MS, DEFAULT_PAYLOAD_BYTES, DEFAULT_RETRIES,
    DEFAULT_TIMEOUT_MS,
};
use pingmux_core::{init_engine, ping_host_opts, shutdown_engine, PingOptions};
use pingmux_result::{summarize, ProbeOutcome, RollingStats, RttSummary, SUMMARY_CSV_HEADER};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExportFormat {
    Csv,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "pingmux")]
#[command(about = "Multiplexed ICMP ping", long_about = None)]
struct Args {
    #[arg(value_name = "target")]
    target: String,

    /// Per-probe reply timeout in milliseconds.
    #[arg(short = 'W', short_alias = 't', long = "timeout", default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Probes per attempt; stops early on the first reply.
    #[arg(short = 'r', long = "retries", default_value_t = DEFAULT_RETRIES)]
    retries: u32,

    /// Interface name substring to bind or capture on.
    #[arg(long = "if", value_name = "name")]
    interface: Option<String>,

    #[arg(short = 'q', long = "quiet", default_value_t = false)]
    quiet: bool,

    /// Print only the statistics block at the end.
    #[arg(long = "summary", default_value_t = false)]
    summary: bool,

    /// Ping until interrupted, pacing probes by --interval.
    #[arg(long = "continuous", default_value_t = false)]
    continuous: bool,

    /// Delay between continuous-mode probes in milliseconds.
    #[arg(
        short = 'i',
        long = "interval",
        default_value_t = DEFAULT_INTERVAL_MS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    interval_ms: u64,

    /// Attempt budget; continuous mode runs unbounded when omitted.
    #[arg(short = 'c', long = "count", value_parser = clap::value_parser!(u64).range(1..))]
    count: Option<u64>,

    /// Extra payload bytes appended after the embedded timestamp.
    #[arg(short = 's', long = "size", default_value_t = DEFAULT_PAYLOAD_BYTES)]
    payload_size: usize,

    /// Override the outgoing IP TTL.
    #[arg(long = "ttl", value_parser = clap::value_parser!(u8).range(1..))]
    ttl: Option<u8>,

    /// Prefix each reply line with the epoch time.
    #[arg(long = "timestamp", default_value_t = false)]
    timestamp: bool,

    #[arg(long = "no-color", default_value_t = false)]
    no_color: bool,

    /// Write the final summary to this file.
    #[arg(long = "export", value_name = "path")]
    export: Option<PathBuf>,

    #[arg(long = "format", value_enum, default_value_t = ExportFormat::Csv)]
    format: ExportFormat,

    /// Shorthand for --export <path> --format csv.
    #[arg(long = "csv", value_name = "path", conflicts_with = "export")]
    csv: Option<PathBuf>,

    /// Shorthand for --export <path> --format json.
    #[arg(long = "json", value_name = "path", conflicts_with_all = ["export", "csv"])]
    json: Option<PathBuf>,

    /// Append to the export file instead of truncating it.
    #[arg(long = "export-append", default_value_t = false)]
    export_append: bool,

    /// Route probes through the persistent correlation engine.
    #[arg(long = "engine", default_value_t = false)]
    engine: bool,
}

fn main() -> ExitCode {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("warn"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    run(Args::parse())
}

fn run(args: Args) -> ExitCode {
    let colors = !args.no_color;
    let opts = PingOptions {
        timeout: Duration::from_millis(args.timeout_ms),
        retries: args.retries,
        interface: args.interface.clone(),
        payload_size: args.payload_size,
        ttl: args.ttl,
        ..Default::default()
    };

    if args.engine {
        if let Err(err) = init_engine(args.interface.as_deref()) {
            eprintln!("engine unavailable: {err}");
            return ExitCode::FAILURE;
        }
        debug!("probing through the shared engine");
    }

    let code = if args.continuous {
        run_continuous(&args, &opts, colors)
    } else {
        run_batch(&args, &opts, colors)
    };

    if args.engine {
        shutdown_engine();
    }
    code
}

fn run_batch(args: &Args, opts: &PingOptions, colors: bool) -> ExitCode {
    let attempts = args
        .count
        .unwrap_or_else(|| u64::from(opts.retries.max(1)));

    let mut probes: Vec<ProbeOutcome> = Vec::new();
    let mut best: Option<(i64, i32)> = None;
    for _ in 0..attempts {
        let result = ping_host_opts(&args.target, opts);
        if result.reachable && best.map_or(true, |(rtt, _)| result.rtt_ms < rtt) {
            best = Some((result.rtt_ms, result.ttl));
        }
        probes.extend(result.probes);
    }

    if !args.quiet && !args.summary {
        println!(
            "Pinging {} with {} attempt(s), timeout={}ms",
            args.target, attempts, args.timeout_ms
        );
        for (idx, probe) in probes.iter().enumerate() {
            if probe.success {
                println!(
                    "Attempt {}: Reply, RTT={}ms, TTL={}",
                    idx + 1,
                    probe.rtt_ms,
                    probe.ttl
                );
            } else {
                println!("Attempt {}: Failed ({})", idx + 1, probe.error);
            }
        }
    }

    let Some((rtt_ms, ttl)) = best else {
        println!(
            "{}{}",
            line_prefix(args.timestamp),
            paint(
                &format!("Host {} not reachable", args.target),
                RED,
                colors
            )
        );
        return ExitCode::FAILURE;
    };

    if args.summary {
        let summary = summarize(&args.target, &probes);
        print!("{summary}");
        export_if_requested(args, &summary);
    } else {
        println!(
            "{}{} RTT={}ms TTL={}",
            line_prefix(args.timestamp),
            paint(&format!("Reply from {}", args.target), GREEN, colors),
            rtt_ms,
            ttl
        );
    }
    ExitCode::SUCCESS
}

fn run_continuous(args: &Args, opts: &PingOptions, colors: bool) -> ExitCode {
    let cancel = CancellationToken::new();
    install_sigint_handler(&cancel);

    println!(
        "Pinging {} continuously, interval={}ms (CTRL+C to stop)",
        args.target, args.interval_ms
    );

    let mut stats = RollingStats::new();
    while !cancel.is_cancelled() && args.count.map_or(true, |count| stats.sent < count) {
        let result = ping_host_opts(&args.target, opts);
        stats.record(result.reachable, result.rtt_ms);
        if result.reachable {
            println!(
                "{}{} RTT={}ms TTL={}",
                line_prefix(args.timestamp),
                paint(&format!("Reply from {}", args.target), GREEN, colors),
                result.rtt_ms,
                result.ttl
            );
        } else {
            println!(
                "{}{}",
                line_prefix(args.timestamp),
                paint("Request timed out", RED, colors)
            );
        }
        std::thread::sleep(Duration::from_millis(args.interval_ms));
    }

    let summary = stats.summary(&args.target);
    print!("\n{summary}");
    export_if_requested(args, &summary);
    ExitCode::SUCCESS
}

fn export_if_requested(args: &Args, summary: &RttSummary) {
    if let Some((path, format)) = export_settings(args) {
        if let Err(err) = write_summary(&path, format, summary, args.export_append) {
            eprintln!("export to {} failed: {err}", path.display());
        }
    }
}

/// The shorthand flags win over --export/--format.
fn export_settings(args: &Args) -> Option<(PathBuf, ExportFormat)> {
    if let Some(path) = &args.csv {
        return Some((path.clone(), ExportFormat::Csv));
    }
    if let Some(path) = &args.json {
        return Some((path.clone(), ExportFormat::Json));
    }
    args.export.clone().map(|path| (path, args.format))
}

fn write_summary(
    path: &Path,
    format: ExportFormat,
    summary: &RttSummary,
    append: bool,
) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)?;
    match format {
        ExportFormat::Csv => {
            if !append {
                writeln!(file, "{SUMMARY_CSV_HEADER}")?;
            }
            writeln!(file, "{}", summary.csv_row())?;
        }
        ExportFormat::Json => {
            let line = serde_json::to_string(summary).map_err(std::io::Error::other)?;
            writeln!(file, "{line}")?;
        }
    }
    Ok(())
}

fn paint(text: &str, color: &str, enabled: bool) -> String {
    if enabled {
        format!("{color}{text}{RESET}")
    } else {
        text.to_string()
    }
}

fn line_prefix(timestamp: bool) -> String {
    if !timestamp {
        return String::new();
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("[{}.{:06}] ", now.as_secs(), now.subsec_micros())
}

#[cfg(unix)]
fn install_sigint_handler(cancel: &CancellationToken) {
    use std::sync::OnceLock;

    static CANCEL: OnceLock<CancellationToken> = OnceLock::new();

    extern "C" fn on_sigint(_sig: libc::c_int) {
        // Only an atomic store; safe in signal context.
        if let Some(token) = CANCEL.get() {
            token.cancel();
        }
    }

    if CANCEL.set(cancel.clone()).is_ok() {
        unsafe {
            libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
        }
    }
}

#[cfg(not(unix))]
fn install_sigint_handler(_cancel: &CancellationToken) {}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pingmux_result::from_series;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn export_shortcuts_override_format() {
        let args = Args::parse_from(["pingmux", "1.1.1.1", "--json", "out.json"]);
        let (path, format) = export_settings(&args).unwrap();
        assert_eq!(path, PathBuf::from("out.json"));
        assert_eq!(format, ExportFormat::Json);

        let args = Args::parse_from(["pingmux", "1.1.1.1", "--csv", "out.csv", "--format", "json"]);
        let (_, format) = export_settings(&args).unwrap();
        assert_eq!(format, ExportFormat::Csv);

        let args = Args::parse_from(["pingmux", "1.1.1.1", "--export", "out.dat", "--format", "json"]);
        let (path, format) = export_settings(&args).unwrap();
        assert_eq!(path, PathBuf::from("out.dat"));
        assert_eq!(format, ExportFormat::Json);

        let args = Args::parse_from(["pingmux", "1.1.1.1"]);
        assert!(export_settings(&args).is_none());
    }

    #[test]
    fn summary_export_appends_without_repeating_header() {
        let path = std::env::temp_dir().join(format!("pingmux-export-{}.csv", std::process::id()));
        let summary = from_series("1.1.1.1", 2, &[5, 7]);
        write_summary(&path, ExportFormat::Csv, &summary, false).unwrap();
        write_summary(&path, ExportFormat::Csv, &summary, true).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], SUMMARY_CSV_HEADER);
        assert_eq!(lines[1], lines[2]);
        assert!(lines[1].starts_with("1.1.1.1,2,2,0,5,6.00,7,"));
    }

    #[test]
    fn timestamp_prefix_shape() {
        assert_eq!(line_prefix(false), "");
        let prefix = line_prefix(true);
        assert!(prefix.starts_with('['));
        assert!(prefix.ends_with("] "));
        let inner = &prefix[1..prefix.len() - 2];
        let (secs, micros) = inner.split_once('.').unwrap();
        assert!(secs.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(micros.len(), 6);
    }

    #[test]
    fn paint_honors_color_toggle() {
        assert_eq!(paint("x", GREEN, false), "x");
        assert_eq!(paint("x", GREEN, true), "\x1b[32mx\x1b[0m");
    }
}
