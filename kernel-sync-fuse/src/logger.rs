//! Console logger with the kernel's per-level color coding.
//!
//! Log output goes to stderr with ANSI escape sequences; the level is
//! chosen by the `LOG` environment variable (`ERROR`, `WARN`, `INFO`,
//! `DEBUG`), anything else switches logging off.

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Install the logger. Call once, before the first log statement.
pub fn init() {
    static LOGGER: HarnessLogger = HarnessLogger;
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(match std::env::var("LOG").as_deref() {
        Ok("ERROR") => LevelFilter::Error,
        Ok("WARN") => LevelFilter::Warn,
        Ok("INFO") => LevelFilter::Info,
        Ok("DEBUG") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    });
}

struct HarnessLogger;

impl Log for HarnessLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!(
            "\u{1B}[{}m[FUSE][{:>5}] {}\u{1B}[0m",
            level_to_color_code(record.level()),
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

fn level_to_color_code(level: Level) -> u8 {
    match level {
        Level::Error => 31, // Red
        Level::Warn => 93,  // BrightYellow
        Level::Info => 34,  // Blue
        Level::Debug => 32, // Green
        Level::Trace => 90, // BrightBlack
    }
}
