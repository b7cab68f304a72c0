//! Structured file logging for kiln runs.
//!
//! Log levels:
//! - ERROR: failures that stop a run (persistence, planning)
//! - WARN: recoverable trouble (backend errors being retried, drift, abandoned tasks)
//! - INFO: run lifecycle and task transitions
//! - DEBUG: per-attempt detail (requests, oracle steps)
//! - TRACE: raw command output and backend payloads
//!
//! Debug mode is enabled with `--debug` or `KILN_DEBUG=1`; `KILN_DEBUG=trace`
//! also records raw command output.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

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

fn level_from_env() -> Option<LogLevel> {
    let value = std::env::var("KILN_DEBUG").ok()?;
    if value.eq_ignore_ascii_case("trace") {
        Some(LogLevel::Trace)
    } else if value == "1" || value.eq_ignore_ascii_case("true") {
        Some(LogLevel::Debug)
    } else {
        None
    }
}

/// Initialize logging into `dir/kiln.log`.
///
/// Falls back to `~/.kiln/kiln.log` when `dir` cannot be created. The log
/// is appended to, so consecutive runs against one state directory share
/// a single history.
pub fn init_in(dir: &Path, debug: bool) {
    let level = match (debug, level_from_env()) {
        (_, Some(level)) => level,
        (true, None) => LogLevel::Debug,
        (false, None) => LogLevel::Info,
    };
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);

    let target = if std::fs::create_dir_all(dir).is_ok() {
        Some(dir.to_path_buf())
    } else {
        dirs::home_dir()
            .map(|h| h.join(".kiln"))
            .filter(|d| std::fs::create_dir_all(d).is_ok())
    };

    if let Some(dir) = target {
        LOG_PATH.set(dir.join("kiln.log")).ok();
    }
}

pub fn is_debug() -> bool {
    get_level() >= LogLevel::Debug
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Path of the active log file, if logging was initialized.
pub fn log_path() -> Option<&'static Path> {
    LOG_PATH.get().map(PathBuf::as_path)
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }

    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
        }
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// Log at INFO level.
#[macro_export]
macro_rules! klog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log at DEBUG level (only when debug mode is on).
#[macro_export]
macro_rules! klog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
