//! Kernel log sink.
//!
//! Records go to the host's standard error, which stands in for the
//! kernel debug port.

use std::io::Write as _;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

/// Installs the kernel logger. Call this once during early init.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Format: "[LEVEL] target: message"
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "[{:<5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}
