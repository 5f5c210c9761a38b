//! Process logging on the `log` facade with a flexi_logger backend.
//!
//! Lines look like `<utc ts> [LEVEL] pid=<pid> trace_id=<id> file:line msg`,
//! where the pid, trace id and caller parts follow the `logger` config.

use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use flexi_logger::{
    Cleanup, Criterion, DeferredNow, Duplicate, FileSpec, LogSpecification, Logger as FlexiLogger,
    LoggerHandle, Naming, WriteMode,
};
use log::{LevelFilter, Record};
use tokio::task_local;

use crate::config::Logger;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";
const MIB: u64 = 1024 * 1024;

#[derive(Clone, Copy)]
struct LineFormat {
    pid: bool,
    caller: bool,
    trace_id: bool,
}

impl From<&Logger> for LineFormat {
    fn from(cfg: &Logger) -> Self {
        Self {
            pid: !cfg.nopid,
            caller: cfg.caller,
            trace_id: cfg.traceid,
        }
    }
}

static LINE_FORMAT: OnceLock<LineFormat> = OnceLock::new();
static HANDLE: OnceLock<Mutex<LoggerHandle>> = OnceLock::new();

task_local! {
    static TRACE_ID: String;
}

pub fn init(config: &Logger, verbose: bool) -> Result<()> {
    let level = match verbose {
        true => LevelFilter::Debug,
        false => parse_level(&config.level).unwrap_or(LevelFilter::Info),
    };
    LINE_FORMAT.get_or_init(|| LineFormat::from(config));

    let logger = FlexiLogger::try_with_str(level.as_str())
        .context("init logger")?
        .duplicate_to_stderr(Duplicate::Warn)
        .format_for_stdout(write_line);
    let logger = match config.path.trim() {
        "" => logger,
        path => to_file(logger, Path::new(path), config)?,
    };

    let handle = logger.start().context("start logger")?;
    let _ = HANDLE.set(Mutex::new(handle));
    Ok(())
}

fn to_file(logger: FlexiLogger, path: &Path, config: &Logger) -> Result<FlexiLogger> {
    let spec = FileSpec::try_from(path).with_context(|| format!("log file {}", path.display()))?;
    let mut logger = logger.log_to_file(spec).format(write_line);
    if config.max_size > 0 {
        let cleanup = match config.max_backups {
            0 => Cleanup::Never,
            n => Cleanup::KeepLogFiles(n as usize),
        };
        logger = logger.rotate(Criterion::Size(config.max_size * MIB), Naming::Numbers, cleanup);
    }
    Ok(logger.write_mode(WriteMode::BufferAndFlush))
}

/// Parses `trace`, `debug`, `info`, `warn`/`warning` and `error`.
pub fn parse_level(raw: &str) -> Option<LevelFilter> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::Trace),
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        _ => None,
    }
}

/// Swaps the running log level. Without an initialized backend only the
/// facade filter moves.
pub fn set_level(level: LevelFilter) {
    let Some(handle) = HANDLE.get() else {
        log::set_max_level(level);
        return;
    };
    let spec = LogSpecification::builder().default(level).build();
    match handle.lock() {
        Ok(mut handle) => handle.set_new_spec(spec),
        Err(_) => log::set_max_level(level),
    }
}

fn write_line(writer: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    let format = LINE_FORMAT.get().copied().unwrap_or(LineFormat {
        pid: true,
        caller: false,
        trace_id: false,
    });
    write!(writer, "{} [{}]", now.now_utc_owned().format(TIMESTAMP_FORMAT), record.level())?;
    if format.pid {
        write!(writer, " pid={}", std::process::id())?;
    }
    if format.trace_id {
        if let Some(id) = current_trace_id() {
            write!(writer, " trace_id={id}")?;
        }
    }
    if format.caller {
        write!(writer, " {}:{}", record.file().unwrap_or("-"), record.line().unwrap_or(0))?;
    }
    writeln!(writer, " {}", record.args())
}

/// Runs `fut` with `trace_id` attached to every line it logs.
pub async fn with_trace_id<T>(trace_id: String, fut: impl std::future::Future<Output = T>) -> T {
    TRACE_ID.scope(trace_id, fut).await
}

fn current_trace_id() -> Option<String> {
    TRACE_ID.try_with(|id| id.clone()).ok()
}
