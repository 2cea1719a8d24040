//! File logging for netgauge.
//!
//! Log levels:
//! - ERROR: Failures that abort a run or the worker
//! - WARN: Recoverable conditions (network failures, dropped replies)
//! - INFO: Worker start/stop, run start/finish
//! - DEBUG: Message processing, phase transitions, publishes
//! - TRACE: Wire-level exchange details
//!
//! The level comes from `NETGAUGE_LOG` (`error`..`trace`); `--debug` or
//! `NETGAUGE_DEBUG=1` raise it to at least DEBUG. Lines are tagged with the
//! writing thread, so worker activity shows up as `comm-worker`.
//! Nothing is written until one of the `init` functions has run.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

struct Sink {
    path: PathBuf,
    file: Mutex<File>,
}

static SINK: OnceLock<Sink> = OnceLock::new();
static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Level implied by the environment and the `--debug` flag.
fn level_from_env(debug: bool) -> LogLevel {
    let base = std::env::var("NETGAUGE_LOG")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(LogLevel::Info);
    let env_debug = std::env::var("NETGAUGE_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if debug || env_debug {
        base.max(LogLevel::Debug)
    } else {
        base
    }
}

/// Log to `~/.netgauge/netgauge.log`, truncating it.
pub fn init_with_debug(debug: bool) {
    let Some(dir) = dirs::home_dir().map(|h| h.join(".netgauge")) else {
        return;
    };
    let _ = std::fs::create_dir_all(&dir);
    init_at(&dir.join("netgauge.log"), level_from_env(debug));
}

/// Log to `path` at `level`. Only the first successful call opens a file;
/// later calls just change the level.
pub fn init_at(path: &Path, level: LogLevel) {
    set_level(level);
    if SINK.get().is_some() {
        return;
    }
    if let Ok(file) = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
    {
        let _ = SINK.set(Sink {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        });
    }
}

/// Where log lines go, once initialized.
pub fn log_path() -> Option<&'static Path> {
    SINK.get().map(|s| s.path.as_path())
}

pub fn set_level(level: LogLevel) {
    LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > self::level() {
        return;
    }
    let Some(sink) = SINK.get() else {
        return;
    };

    let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
    let thread = std::thread::current();
    let line = format!(
        "[{}] {:<5} {}: {}\n",
        timestamp,
        level.as_str(),
        thread.name().unwrap_or("-"),
        msg
    );
    // One write per line keeps worker and caller output from interleaving.
    let mut file = sink.file.lock().unwrap_or_else(|p| p.into_inner());
    let _ = file.write_all(line.as_bytes());
}

pub fn log(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

#[macro_export]
macro_rules! nlog {
    ($($arg:tt)*) => {
        $crate::log::log(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! nlog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! nlog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Only written when the level is DEBUG or above.
#[macro_export]
macro_rules! nlog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! nlog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
