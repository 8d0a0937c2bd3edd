//! remit: the client driver.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use remit::bootstrap::{Bootstrapper, ProbePorts, SshLauncher, DEFAULT_PORT_RANGE};
use remit::client::SyncClient;
use remit::error::{Result, SyncError};
use remit::filter::PatternFilter;
use remit::logger::{Logger, NoopLogger, TextLogger};
use remit::options::SyncOptions;
use remit::progress::{HumanSink, JsonSink, ProgressSink, SilentSink};
use remit::remote::parse_dest;
use remit::session::{CancelFlag, Session};

/// One-way delta file synchronizer over an SSH-tunneled transport.
#[derive(Parser, Debug)]
#[command(name = "remit", version, about)]
struct Cli {
    /// Source paths followed by the destination (user@host:path)
    #[arg(required = true, num_args = 2..)]
    paths: Vec<String>,

    /// Recurse into subdirectories
    #[arg(short = 'r', long)]
    recursive: bool,

    /// Delete remote files that are absent locally (needs --recursive)
    #[arg(long)]
    delete: bool,

    /// Send changed files whole instead of computing deltas
    #[arg(short = 'W', long)]
    whole_file: bool,

    /// Compare file content by hash, not just metadata
    #[arg(short = 'c', long)]
    checksum: bool,

    /// Classify only; change nothing on the remote
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Skip files that do not already exist on the remote
    #[arg(long)]
    existing: bool,

    /// Keep the source path prefix in destination paths
    #[arg(short = 'R', long)]
    relative: bool,

    /// Zstandard level for the bulk phases (1-22)
    #[arg(short = 'z', long, default_value_t = 6)]
    compress_level: u8,

    /// Connection timeout in seconds
    #[arg(long = "contimeout", default_value_t = 10)]
    contimeout: u32,

    /// Per-file output; repeat for more detail
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Structured progress, one JSON object per line
    #[arg(long)]
    json: bool,

    /// Loopback address the forwarded port terminates on
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// Port the worker listens on remotely
    #[arg(long, default_value_t = 44499)]
    port: u16,

    /// Include files matching this pattern
    #[arg(long)]
    include: Vec<String>,

    /// Exclude files matching this pattern
    #[arg(long)]
    exclude: Vec<String>,

    /// Read include patterns from a file
    #[arg(long, value_name = "FILE")]
    include_from: Option<PathBuf>,

    /// Read exclude patterns from a file
    #[arg(long, value_name = "FILE")]
    exclude_from: Option<PathBuf>,

    /// Transfer exactly the paths listed in a file
    #[arg(long, value_name = "FILE")]
    files_from: Option<PathBuf>,

    /// Accepted for compatibility; delta transfer already reuses
    /// destination content as its basis
    #[arg(long, value_name = "DIR")]
    copy_dest: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("remit: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let (dest_str, source_args) = cli
        .paths
        .split_last()
        .ok_or_else(|| SyncError::Usage("missing destination".into()))?;
    let dest = parse_dest(dest_str)?;
    let sources: Vec<PathBuf> = source_args.iter().map(PathBuf::from).collect();

    let opts = SyncOptions {
        recursive: cli.recursive,
        delete_extras: cli.delete,
        whole_file: cli.whole_file,
        checksum: cli.checksum,
        dry_run: cli.dry_run,
        existing: cli.existing,
        relative: cli.relative,
        compress_level: cli.compress_level,
        connection_timeout_secs: cli.contimeout,
        verbosity: cli.verbose.min(3),
        quiet: cli.quiet,
        json: cli.json,
    };
    opts.validate()?;

    let mut filter = PatternFilter::new();
    for pattern in &cli.include {
        filter.include(pattern);
    }
    for pattern in &cli.exclude {
        filter.exclude(pattern);
    }
    let usage = |e: anyhow::Error| SyncError::Usage(e.to_string());
    if let Some(file) = &cli.include_from {
        filter.include_from(file).map_err(usage)?;
    }
    if let Some(file) = &cli.exclude_from {
        filter.exclude_from(file).map_err(usage)?;
    }
    if let Some(file) = &cli.files_from {
        filter.files_from(file).map_err(usage)?;
    }

    let progress: Box<dyn ProgressSink> = if cli.quiet {
        Box::new(SilentSink)
    } else if cli.json {
        Box::new(JsonSink)
    } else {
        Box::new(HumanSink::new(opts.verbosity))
    };
    if cli.copy_dest.is_some() {
        progress.warn("--copy-dest has no effect; changed files are patched in place");
    }

    let logger: Box<dyn Logger> = match std::env::var_os("REMIT_LOG_FILE") {
        Some(path) => Box::new(
            TextLogger::new(path)
                .map_err(|e| SyncError::Usage(format!("cannot open log file: {e}")))?,
        ),
        None => Box::new(NoopLogger),
    };
    logger.start(&sources, dest_str);

    let launcher = SshLauncher::new(dest, cli.ip.clone(), cli.port, worker_binary_path());
    let ports = ProbePorts::default();
    let boot = Bootstrapper {
        launcher: &launcher,
        ports: &ports,
        port_range: DEFAULT_PORT_RANGE,
        connect_timeout: Duration::from_secs(opts.connection_timeout_secs as u64),
    };

    let (worker, stream) = boot.start()?;
    let session = Session::from_stream(stream, CancelFlag::new());
    let mut client = SyncClient::new(
        session,
        sources,
        opts,
        &filter,
        logger.as_ref(),
        progress.as_ref(),
    );
    let result = client.run();
    let report = boot.stop(worker);

    match result {
        Ok(summary) => {
            if summary.failed > 0 {
                // The worker names each file it could not land
                for line in report.stderr.iter().filter(|l| l.contains("failed")) {
                    progress.file_failed(line);
                }
            }
            progress.summary(&summary, &client.stats());
            Ok(if summary.failed > 0 { 1 } else { 0 })
        }
        Err(e) => {
            let tail = report.stderr_tail(5);
            if !tail.is_empty() {
                eprintln!("remit: worker output:\n{tail}");
            }
            Err(e)
        }
    }
}

/// The worker binary ships next to the client, the same way the daemon
/// finds its driver.
fn worker_binary_path() -> PathBuf {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("remit"));
    let dir = exe
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let candidate = dir.join("remitd");
    if candidate.exists() {
        candidate
    } else {
        PathBuf::from("remitd")
    }
}
