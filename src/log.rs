use crate::shim;
use chrono::Local;
use rustix::stdio;
use rustix::termios;
use std::ffi::CStr;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

/// Syslog-style message levels.
/// Warning and below are filtered by the process verbosity; errors and
/// worse are always emitted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Level {
    Emerg,
    Alert,
    Crit,
    Err,
    Warning,
    Notice,
    Info,
    Debug,
}

impl Level {
    fn priority(self) -> libc::c_int {
        match self {
            Level::Emerg => libc::LOG_EMERG,
            Level::Alert => libc::LOG_ALERT,
            Level::Crit => libc::LOG_CRIT,
            Level::Err => libc::LOG_ERR,
            Level::Warning => libc::LOG_WARNING,
            Level::Notice => libc::LOG_NOTICE,
            Level::Info => libc::LOG_INFO,
            Level::Debug => libc::LOG_DEBUG,
        }
    }

    /// Minimum verbosity at which messages of this level are emitted.
    fn threshold(self) -> i32 {
        match self {
            Level::Warning => -1,
            Level::Notice => 0,
            Level::Info => 1,
            Level::Debug => 2,
            _ => i32::MIN,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Level::Emerg => "emergency",
            Level::Alert => "alert",
            Level::Crit => "critical",
            Level::Err => "error",
            Level::Warning => "warning",
            Level::Notice => "notice",
            Level::Info => "info",
            Level::Debug => "debug",
        }
    }
}

/// Process verbosity: -v increments, -q decrements.
static VERBOSITY: AtomicI32 = AtomicI32::new(0);

pub fn set_verbosity(verbosity: i32) {
    VERBOSITY.store(verbosity, Ordering::Relaxed);
}

pub fn verbosity() -> i32 {
    VERBOSITY.load(Ordering::Relaxed)
}

/// Check if messages of the given level pass the verbosity filter.
pub fn enabled(level: Level) -> bool {
    verbosity() >= level.threshold()
}

/// Connect to the system logger.
/// Called when the process expects to outlive its terminal.
pub fn open(ident: &'static CStr) {
    shim::openlog(ident);
}

/// Emit one message: to stderr if it's a terminal, to syslog otherwise.
/// Invoked via the log! macro.
pub fn write(level: Level, args: fmt::Arguments) {
    if !enabled(level) {
        return;
    }

    let msg = args.to_string();
    if termios::isatty(stdio::stderr()) {
        eprintln!("{} {}: {}", Local::now().format("%T%.3f"), level.tag(), msg);
    } else {
        shim::syslog(level.priority(), &msg);
    }
}

/// Log a message at the given level.
#[macro_export]
macro_rules! log {
    ($lvl:expr, $fmt:expr $(,$args:expr)* $(,)?) => {
        $crate::log::write($lvl, format_args!($fmt $(,$args)*))
    };
}

/// Log an error and exit with EXIT_FAILURE.
#[macro_export]
macro_rules! die {
    ($fmt:expr $(,$args:expr)* $(,)?) => {{
        $crate::log::write($crate::log::Level::Err, format_args!($fmt $(,$args)*));
        std::process::exit($crate::status::EXIT_FAILURE);
    }};
}
