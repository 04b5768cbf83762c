use std::{
    fmt,
    io::{self, Write as _},
    thread,
    time::Instant,
};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Writes log records to stderr, prefixed with the time since startup and the
/// name of the emitting thread.
struct StderrLogger {
    start: Instant,
    level: LevelFilter,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let elapsed = self.start.elapsed();
        let current = thread::current();
        let name = current.name().unwrap_or("?");
        let mut stderr = io::stderr().lock();
        let _ = writeln!(
            stderr,
            "{elapsed:?} [{name}] {} {}",
            LevelFormat(record.level()),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

struct LevelFormat(Level);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.0 {
            Level::Trace => 35,
            Level::Debug => 34,
            Level::Info => 32,
            Level::Warn => 33,
            Level::Error => 31,
        };
        write!(f, "\x1B[{color};1m{:>5}\x1B[0m", self.0.as_str())
    }
}

/// Installs the stderr logger as the process-wide logger.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    let logger = Box::leak(Box::new(StderrLogger {
        start: Instant::now(),
        level,
    }));
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}
