//! The process-wide logger behind the [`log`] facade.
//!
//! Attaches run context to every record: elapsed wall time since startup,
//! the worker thread that produced it, and the source location. Writes go
//! to stdout; errors are mirrored to stderr so they survive redirection of
//! the main stream.

use std::io::Write;
use std::time::Instant;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use once_cell::sync::{Lazy, OnceCell};

use crate::utility::time::TimeParts;

static ELISE_LOGGER: Lazy<EliseLogger> = Lazy::new(EliseLogger::new);

/// Initialize the logger.
pub fn init(max_log_level: LevelFilter, log_errors_to_stderr: bool) -> Result<(), SetLoggerError> {
    ELISE_LOGGER.max_log_level.set(max_log_level).unwrap();
    ELISE_LOGGER
        .log_errors_to_stderr
        .set(log_errors_to_stderr)
        .unwrap();

    log::set_logger(&*ELISE_LOGGER)?;
    log::set_max_level(max_log_level);

    // flush pending output before a panic unwinds past main
    let default_panic_handler = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::logger().flush();
        default_panic_handler(panic_info);
    }));

    Ok(())
}

pub struct EliseLogger {
    start: Instant,
    max_log_level: OnceCell<LevelFilter>,
    log_errors_to_stderr: OnceCell<bool>,
}

impl EliseLogger {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            max_log_level: OnceCell::new(),
            log_errors_to_stderr: OnceCell::new(),
        }
    }

    /// If the maximum log level has not yet been set, returns
    /// `LevelFilter::Trace`.
    fn max_level(&self) -> LevelFilter {
        self.max_log_level
            .get()
            .copied()
            .unwrap_or(LevelFilter::Trace)
    }
}

impl Log for EliseLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let parts = TimeParts::from_nanos(self.start.elapsed().as_nanos());
        let thread = std::thread::current();
        let line = format!(
            "{:02}:{:02}:{:02}.{:06} [{}] [{level}] [{file}:{line}] [{module}] {msg}\n",
            parts.hours,
            parts.mins,
            parts.secs,
            parts.nanos / 1000,
            thread.name().unwrap_or("-"),
            level = record.level(),
            file = record
                .file()
                .map(|f| f.rsplit('/').next().unwrap_or(f))
                .unwrap_or("n/a"),
            line = record.line().unwrap_or(0),
            module = record.module_path().unwrap_or("n/a"),
            msg = record.args(),
        );

        // one write_all per record keeps interleaving at line granularity
        // across worker threads
        let stdout = std::io::stdout();
        let _ = stdout.lock().write_all(line.as_bytes());

        if record.level() <= Level::Error && self.log_errors_to_stderr.get().copied().unwrap_or(false)
        {
            let stderr = std::io::stderr();
            let _ = stderr.lock().write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}
