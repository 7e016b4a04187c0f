//! Serial-backed implementation of the `log` facade
//!
//! Every subsystem logs through `log::{error, warn, info, debug, trace}`;
//! records are written to COM1 with the level and the module-path target.

use log::{LevelFilter, Log, Metadata, Record};

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::serial::_serial_print(format_args!(
            "[{:5}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger. Must run after `serial::init`.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Raise or lower the global verbosity at runtime (shell `debug` toggle).
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn logger_enabled_respects_max_level() {
        log::set_max_level(LevelFilter::Info);
        let meta = Metadata::builder().level(log::Level::Debug).build();
        assert!(!LOGGER.enabled(&meta));
        let meta = Metadata::builder().level(log::Level::Warn).build();
        assert!(LOGGER.enabled(&meta));
    }
}
