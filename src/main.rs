//! `tracebuf` command line tool.
//!
//! ```bash
//! tracebuf decode /dev/shm/traces --recursive --pid 4242 --msg-regex 'timeout|retry'
//! tracebuf live /dev/shm/traces --filter 'sensor.*' --time-min 2025-11-25T21:46:29 --summary
//! tracebuf info /dev/shm/traces/sensor.clltk_trace
//! tracebuf write /tmp/demo.clltk_trace --name demo --message hello --count 10
//! ```

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracebuf::config::Config;
use tracebuf::filter::{parse_time, TracepointFilter};
use tracebuf::live::{LiveConfig, LiveDecoder, WriteSink};
use tracebuf::logging::{self, LoggingConfig};
use tracebuf::snapshot::{self, name_filter, SnapTracebuffer};
use tracebuf::tracebuffer::tracepoint::encode_dynamic_body;
use tracebuf::tracebuffer::{RawFormatter, SourceType, TracebufferFile};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "tracebuf")]
#[command(about = "Decode memory-mapped trace ring buffers", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides logging.level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode tracebuffers offline, merged by timestamp
    Decode {
        /// Tracebuffer file or directory
        path: PathBuf,

        /// Regex the whole tracebuffer name must match
        #[arg(long, default_value = "^.*$")]
        filter: String,

        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,

        #[command(flatten)]
        tracepoints: FilterArgs,
    },

    /// Follow tracebuffers as they are written
    Live {
        /// Tracebuffer file or directory
        path: PathBuf,

        /// Regex the whole tracebuffer name must match
        #[arg(long)]
        filter: Option<String>,

        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,

        #[command(flatten)]
        tracepoints: FilterArgs,

        /// Reorder buffer capacity (0 = unbounded)
        #[arg(long)]
        buffer_size: Option<usize>,

        #[arg(long)]
        order_delay_ms: Option<u64>,

        #[arg(long)]
        poll_interval_ms: Option<u64>,

        /// Only show tracepoints written after start
        #[arg(long)]
        skip_existing: bool,

        /// Print counters on exit
        #[arg(long)]
        summary: bool,
    },

    /// Show the state of one tracebuffer
    Info {
        path: PathBuf,
    },

    /// Append dynamic tracepoints, creating the file if needed
    Write {
        path: PathBuf,

        #[arg(long)]
        name: String,

        #[arg(long)]
        message: String,

        #[arg(long, default_value = "1")]
        count: u64,

        /// Ring buffer size in bytes for a new file
        #[arg(long, default_value = "65536")]
        capacity: u64,
    },
}

/// Tracepoint-level filters shared by `decode` and `live`.
#[derive(Args)]
struct FilterArgs {
    /// Keep only these process ids (repeatable)
    #[arg(long = "pid", value_name = "PID")]
    pids: Vec<u32>,

    /// Keep only these thread ids (repeatable)
    #[arg(long = "tid", value_name = "TID")]
    tids: Vec<u32>,

    /// Keep messages containing this text
    #[arg(long, value_name = "TEXT", conflicts_with = "msg_regex")]
    msg: Option<String>,

    /// Keep messages matching this regex
    #[arg(long, value_name = "REGEX")]
    msg_regex: Option<String>,

    /// Keep tracepoints whose source file path contains this text
    #[arg(long, value_name = "TEXT", conflicts_with = "file_regex")]
    file: Option<String>,

    /// Keep tracepoints whose source file path matches this regex
    #[arg(long, value_name = "REGEX")]
    file_regex: Option<String>,

    /// Earliest timestamp: Unix seconds or ISO 8601 (UTC unless an offset is given)
    #[arg(long, value_name = "TIME")]
    time_min: Option<String>,

    /// Latest timestamp, same formats as --time-min
    #[arg(long, value_name = "TIME")]
    time_max: Option<String>,
}

impl FilterArgs {
    fn build(&self) -> Result<TracepointFilter> {
        let time_min = self.time_min.as_deref().map(parse_time).transpose()?;
        let time_max = self.time_max.as_deref().map(parse_time).transpose()?;
        let mut filter = TracepointFilter::new()
            .with_time_range(time_min.unwrap_or(0), time_max.unwrap_or(u64::MAX))
            .with_pids(self.pids.iter().copied())
            .with_tids(self.tids.iter().copied());
        if let Some(text) = &self.msg {
            filter = filter.with_message(text, false)?;
        }
        if let Some(regex) = &self.msg_regex {
            filter = filter.with_message(regex, true)?;
        }
        if let Some(text) = &self.file {
            filter = filter.with_file(text, false)?;
        }
        if let Some(regex) = &self.file_regex {
            filter = filter.with_file(regex, true)?;
        }
        Ok(filter)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::load().context("loading configuration")?,
    };
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    config.validate()?;
    logging::init(LoggingConfig::from_config(&config)?)?;

    match cli.command {
        Commands::Decode {
            path,
            filter,
            recursive,
            tracepoints,
        } => decode(&path, &filter, recursive, &tracepoints.build()?),
        Commands::Live {
            path,
            filter,
            recursive,
            tracepoints,
            buffer_size,
            order_delay_ms,
            poll_interval_ms,
            skip_existing,
            summary,
        } => {
            let section = &mut config.live;
            if let Some(filter) = filter {
                section.tracebuffer_filter = filter;
            }
            if let Some(size) = buffer_size {
                section.buffer_size = size;
            }
            if let Some(delay) = order_delay_ms {
                section.order_delay_ms = delay;
            }
            if let Some(interval) = poll_interval_ms {
                section.poll_interval_ms = interval;
            }
            config.validate()?;
            let mut live_config = LiveConfig::from_section(path, &config.live);
            live_config.skip_existing = skip_existing;
            live_config.recursive = recursive;
            live_config.tracepoint_filter = tracepoints.build()?;
            live(live_config, summary)
        }
        Commands::Info { path } => info(&path),
        Commands::Write {
            path,
            name,
            message,
            count,
            capacity,
        } => write(&path, &name, &message, count, capacity),
    }
}

fn decode(
    path: &Path,
    filter: &str,
    recursive: bool,
    tracepoints: &TracepointFilter,
) -> Result<()> {
    let filter = name_filter(filter)?;
    let snapshots = SnapTracebuffer::collect(
        path,
        &|name| filter.is_match(name),
        &|tracepoint| tracepoints.matches(tracepoint),
        recursive,
    )
    .with_context(|| format!("decoding {}", path.display()))?;
    if snapshots.is_empty() {
        anyhow::bail!("no tracebuffers found at {}", path.display());
    }

    let mut out = BufWriter::new(std::io::stdout());
    for tracepoint in snapshot::merge(snapshots) {
        writeln!(out, "{}", tracepoint.render(&RawFormatter))?;
    }
    out.flush()?;
    Ok(())
}

fn live(config: LiveConfig, summary: bool) -> Result<()> {
    install_stop_handler();
    let sink = WriteSink::new(BufWriter::new(std::io::stdout()));
    let mut decoder = LiveDecoder::new(config, sink);
    let count = decoder.start().context("starting live decoding")?;
    eprintln!("Monitoring {count} tracebuffer(s)...");

    while !STOP_REQUESTED.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }

    let stats = decoder.stop();
    if summary {
        eprintln!();
        eprintln!("--- Live Decoder Summary ---");
        eprintln!("Tracebuffers:        {}", stats.tracebuffers);
        eprintln!("Tracepoints read:    {}", stats.total_read);
        eprintln!("Tracepoints output:  {}", stats.total_output);
        eprintln!("Tracepoints dropped: {}", stats.buffer.total_dropped);
        eprintln!("Buffer high water:   {}", stats.buffer.high_water_mark);
    }
    Ok(())
}

fn info(path: &Path) -> Result<()> {
    let file =
        TracebufferFile::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = file.reader()?;
    let control = reader.capture()?;
    println!("name:        {}", file.name());
    println!("source:      {}", file.source_type());
    println!("version:     {}", file.version());
    println!("size:        {}", reader.size());
    println!("used:        {}", reader.used()?);
    println!("wrapped:     {}", control.wrapped);
    println!("dropped:     {}", control.dropped);
    println!("entries:     {}", control.entries);
    println!("pending:     {}", reader.pending_bytes()?);
    Ok(())
}

fn write(path: &Path, name: &str, message: &str, count: u64, capacity: u64) -> Result<()> {
    let file = TracebufferFile::open_or_create(path, name, capacity, SourceType::Userspace)
        .with_context(|| format!("opening {}", path.display()))?;
    let writer = file.writer()?;
    let pid = std::process::id();
    let tid = current_tid();
    for _ in 0..count {
        let body = encode_dynamic_body(pid, tid, now_ns(), file!(), u64::from(line!()), message);
        writer.append(&body)?;
    }
    tracing::info!(tracebuffer = file.name(), count, "appended tracepoints");
    Ok(())
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn current_tid() -> u32 {
    // SAFETY: gettid has no preconditions and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> u32 {
    std::process::id()
}

extern "C" fn on_stop_signal(_signal: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::Release);
}

#[allow(unsafe_code)]
fn install_stop_handler() {
    let handler = on_stop_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}
