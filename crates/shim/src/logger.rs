//! Shim logger.
//!
//! Implements the `log::Log` trait to route log messages to the PAL debug
//! console. Level filtering happens at runtime through `log::set_max_level`.

use core::fmt::{self, Write};

use graft_pal::DebugConsole;
use graft_utils::Once;
use log::{LevelFilter, Metadata, Record, SetLoggerError};

/// Global logger instance
static LOGGER: ShimLogger = ShimLogger {
    console: Once::new(),
};

struct ShimLogger {
    console: Once<&'static dyn DebugConsole>,
}

/// `fmt::Write` over a console, so records are formatted without allocating.
struct ConsoleWriter<'a>(&'a dyn DebugConsole);

impl Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

impl log::Log for ShimLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(console) = self.console.get() {
            // Console writes cannot fail
            let _ = writeln!(ConsoleWriter(*console), "{:<5} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the logger, writing to `console`.
///
/// Fails if a logger (this one or another) is already installed.
pub fn init(console: &'static dyn DebugConsole, max_level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    LOGGER.console.call_once(|| console);
    log::set_max_level(max_level);
    Ok(())
}
