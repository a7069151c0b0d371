use log::{LevelFilter, Log, Metadata, Record};
use std::{io::Write, sync::OnceLock};

/// Stdout logger honoring the level configured in
/// [`StoreOptions`](crate::config::StoreOptions).
#[derive(Debug)]
pub struct Logger {
    level: LevelFilter,
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Installs the process-wide logger at `level`. The first installation wins;
/// later calls (and an already installed foreign logger) leave it untouched.
pub fn init(level: LevelFilter) {
    let logger = LOGGER.get_or_init(|| Logger { level });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(logger.level);
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(
                std::io::stdout(),
                "[{}] {} - {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn test_enabled_follows_configured_level() {
        let logger = Logger { level: LevelFilter::Warn };
        assert!(logger.enabled(&Metadata::builder().level(Level::Error).build()));
        assert!(logger.enabled(&Metadata::builder().level(Level::Warn).build()));
        assert!(!logger.enabled(&Metadata::builder().level(Level::Info).build()));
    }

    #[test]
    fn test_init_is_idempotent() {
        init(LevelFilter::Info);
        init(LevelFilter::Trace);
        // The second call must not raise the installed level.
        assert!(log::max_level() <= LevelFilter::Info);
    }
}
