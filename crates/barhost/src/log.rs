//! Diagnostics boundary.
//!
//! Every component reports through a [`Logger`]: one injected [`LogSink`]
//! receiving a severity, the subsystem that is talking (`who`) and the
//! formatted message. The default sink forwards to `tracing`; tests use a
//! recording sink.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use barhost_abi::level;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Fatal,
    Error,
    Warn,
    Info,
    Verbose,
    Debug,
    Trace,
}

impl Level {
    pub const ALL: [Level; 7] = [
        Level::Fatal,
        Level::Error,
        Level::Warn,
        Level::Info,
        Level::Verbose,
        Level::Debug,
        Level::Trace,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Fatal => "fatal",
            Level::Error => "error",
            Level::Warn => "warning",
            Level::Info => "info",
            Level::Verbose => "verbose",
            Level::Debug => "debug",
            Level::Trace => "trace",
        }
    }

    /// Map a level received from a module. Unknown values yield `None`.
    pub fn from_raw(raw: c_int) -> Option<Level> {
        Some(match raw {
            level::FATAL => Level::Fatal,
            level::ERROR => Level::Error,
            level::WARNING => Level::Warn,
            level::INFO => Level::Info,
            level::VERBOSE => Level::Verbose,
            level::DEBUG => Level::Debug,
            level::TRACE => Level::Trace,
            _ => return None,
        })
    }

    /// The closest `tracing` level. `tracing` has no fatal or verbose.
    pub fn to_tracing(self) -> tracing::Level {
        match self {
            Level::Fatal | Level::Error => tracing::Level::ERROR,
            Level::Warn => tracing::Level::WARN,
            Level::Info => tracing::Level::INFO,
            Level::Verbose | Level::Debug => tracing::Level::DEBUG,
            Level::Trace => tracing::Level::TRACE,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown log level '{0}' (expected one of: fatal, error, warning, info, verbose, debug, trace)")]
pub struct UnknownLevel(pub String);

impl FromStr for Level {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Level::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| UnknownLevel(s.to_string()))
    }
}

// =============================================================================
// Sinks
// =============================================================================

pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, who: Option<&str>, args: fmt::Arguments<'_>);
}

/// Forwards to `tracing` events, with the subsystem in a `who` field.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: Level, who: Option<&str>, args: fmt::Arguments<'_>) {
        let who = who.unwrap_or("host");
        match level {
            Level::Fatal => tracing::error!(who, fatal = true, "{}", args),
            Level::Error => tracing::error!(who, "{}", args),
            Level::Warn => tracing::warn!(who, "{}", args),
            Level::Info => tracing::info!(who, "{}", args),
            Level::Verbose | Level::Debug => tracing::debug!(who, "{}", args),
            Level::Trace => tracing::trace!(who, "{}", args),
        }
    }
}

// =============================================================================
// Logger
// =============================================================================

/// Clone-able handle to the process' log sink, tagged with a subsystem.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    who: Option<Arc<str>>,
    max_level: Level,
}

impl Logger {
    pub fn new(sink: impl LogSink + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
            who: None,
            max_level: Level::Trace,
        }
    }

    pub fn tracing() -> Self {
        Self::new(TracingSink)
    }

    /// Drop every message less severe than `level`.
    pub fn with_max_level(mut self, level: Level) -> Self {
        self.max_level = level;
        self
    }

    /// A logger sharing this sink, attributing messages to `who`.
    pub fn scoped(&self, who: impl Into<Arc<str>>) -> Logger {
        Logger {
            sink: Arc::clone(&self.sink),
            who: Some(who.into()),
            max_level: self.max_level,
        }
    }

    pub fn who(&self) -> Option<&str> {
        self.who.as_deref()
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.max_level
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if self.enabled(level) {
            self.sink.log(level, self.who(), args);
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::tracing()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("who", &self.who)
            .field("max_level", &self.max_level)
            .finish_non_exhaustive()
    }
}

/// `log_at!(logger, Warn, "format {}", args)`
#[macro_export]
macro_rules! log_at {
    ($logger:expr, $level:ident, $($arg:tt)+) => {
        $logger.log($crate::log::Level::$level, ::core::format_args!($($arg)+))
    };
}

/// The `log` callback stored in every module data struct. `userdata` points
/// at the `Logger` owned by the module's instance.
pub(crate) unsafe extern "C" fn module_log(userdata: *mut c_void, level: c_int, msg: *const c_char) {
    if userdata.is_null() {
        return;
    }
    let logger = &*(userdata as *const Logger);
    let msg = if msg.is_null() {
        "(null)".into()
    } else {
        CStr::from_ptr(msg).to_string_lossy()
    };
    match Level::from_raw(level) {
        Some(level) => logger.log(level, format_args!("{}", msg)),
        None => logger.log(Level::Error, format_args!("(unknown log level {}) {}", level, msg)),
    }
}
