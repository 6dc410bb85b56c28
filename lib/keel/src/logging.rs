//! Thin facade over `slog`/`sloggers` so every crate in the workspace logs
//! the same way. Components hold a child `Logger` and the root is built once
//! at startup (or discarded entirely in library use and tests).

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// A logger that swallows everything. The default for embedded/library use.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Terminal logger writing to stderr at the given severity.
pub fn terminal(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);

    builder.build().expect("terminal logger construction failed")
}

pub use sloggers::types::Severity as Level;
