//! Structured logger construction, grounded on `flux::logging::init`.
//!
//! The teacher's binary hardcodes a terminal logger at startup; a library
//! can't do that, so this takes an explicit [`LogConfig`] and hands back a
//! root `slog::Logger` that callers thread into [`crate::host::Host::new`].

use slog::{o, Drain};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Where and how verbosely to log. Defaults match the teacher's inline
/// config (`level = "debug"`, `destination = "stderr"`).
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Severity,
    pub destination: Destination,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: Severity::Debug,
            destination: Destination::Stderr,
        }
    }
}

/// Builds a root logger from a [`LogConfig`]. Returns the no-op discard
/// logger if construction fails, so a misconfigured logger never takes down
/// the transport itself.
pub fn build(config: &LogConfig) -> slog::Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(config.level);
    builder.destination(config.destination);

    match builder.build() {
        Ok(logger) => logger,
        Err(_) => slog::Logger::root(slog::Discard.fuse(), o!()),
    }
}

/// A logger that discards everything, for tests and for callers that don't
/// want logging at all.
pub fn discard() -> slog::Logger {
    slog::Logger::root(slog::Discard.fuse(), o!())
}
