//! Logging for the helper process.
//!
//! `stdout` is reserved for the remote-helper protocol, so every log line
//! goes to `stderr`: a millisecond timestamp, a colored level tag, the
//! component, and the message.

use std::io::{self, Write};

use chrono::Local;
use colored::{ColoredString, Colorize};
use log::{Level, Log, Metadata, Record, SetLoggerError};

struct StderrLogger {
    level: Level,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Failing to log must never take the helper down mid-protocol.
        writeln!(
            io::stderr(),
            "{} {} {} {}",
            Local::now().format("%H:%M:%S%.3f"),
            tag(record.level()),
            record.target().bold(),
            record.args()
        )
        .ok();
    }

    fn flush(&self) {}
}

/// The colored, width-aligned level tag of a log line.
fn tag(level: Level) -> ColoredString {
    match level {
        Level::Error => "error".red(),
        Level::Warn => " warn".yellow(),
        Level::Info => " info".green(),
        Level::Debug => "debug".dimmed(),
        Level::Trace => "trace".dimmed(),
    }
}

/// Install the stderr logger at the given level.
pub fn init(level: Level) -> Result<(), SetLoggerError> {
    log::set_max_level(level.to_level_filter());
    log::set_boxed_logger(Box::new(StderrLogger { level }))
}

/// Pick the log level from the environment: a truthy `DEBUG` forces debug
/// logging, otherwise `RUST_LOG` is consulted.
pub fn env_level() -> Level {
    let debug = std::env::var("DEBUG")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false);

    if debug {
        return Level::Debug;
    }
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|l| l.parse().ok())
        .unwrap_or(Level::Info)
}
