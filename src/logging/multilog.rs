use log::{LevelFilter, Log, Metadata};

/// Fans records out to several loggers.
pub struct MultiLogger {
    loggers: Vec<Box<dyn Log>>,
    max_level: LevelFilter,
}

impl Default for MultiLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiLogger {
    pub fn new() -> Self {
        Self {
            loggers: Vec::new(),
            max_level: LevelFilter::Trace,
        }
    }

    pub fn with_logger(mut self, logger: Box<dyn Log>) -> Self {
        self.loggers.push(logger);
        self
    }

    pub fn add_logger(&mut self, logger: Box<dyn Log>) {
        self.loggers.push(logger);
    }

    pub fn init(self) -> Result<(), log::SetLoggerError> {
        log::set_max_level(self.max_level);
        log::set_boxed_logger(Box::new(self))
    }
}

impl Log for MultiLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.loggers.iter().any(|l| l.enabled(metadata))
    }

    fn log(&self, record: &log::Record) {
        self.loggers
            .iter()
            .filter(|l| l.enabled(record.metadata()))
            .for_each(|l| l.log(record));
    }

    fn flush(&self) {
        self.loggers.iter().for_each(|l| l.flush());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use log::Level;

    #[derive(Default)]
    struct CountingLogger {
        enabled: bool,
        count: Arc<AtomicUsize>,
    }

    impl Log for CountingLogger {
        fn enabled(&self, _: &Metadata) -> bool {
            self.enabled
        }

        fn log(&self, _: &log::Record) {
            self.count.fetch_add(1, Ordering::Relaxed);
        }

        fn flush(&self) {}
    }

    fn metadata(target: &str, level: Level) -> Metadata<'_> {
        Metadata::builder().target(target).level(level).build()
    }

    #[test]
    fn test_enabled() {
        let multi_logger = MultiLogger::new()
            .with_logger(Box::new(CountingLogger::default()))
            .with_logger(Box::new(CountingLogger::default()));
        assert!(!multi_logger.enabled(&metadata("cros_sdk", Level::Error)));

        let multi_logger = MultiLogger::new()
            .with_logger(Box::new(CountingLogger::default()))
            .with_logger(Box::new(CountingLogger {
                enabled: true,
                ..Default::default()
            }));
        assert!(multi_logger.enabled(&metadata("cros_sdk", Level::Error)));
    }

    #[test]
    fn test_fan_out() {
        let enabled = CountingLogger {
            enabled: true,
            ..Default::default()
        };
        let enabled_count = enabled.count.clone();
        let disabled = CountingLogger::default();
        let disabled_count = disabled.count.clone();

        let multi_logger = MultiLogger::new()
            .with_logger(Box::new(enabled))
            .with_logger(Box::new(disabled));
        multi_logger.log(&log::Record::builder().build());
        multi_logger.log(&log::Record::builder().build());

        assert_eq!(enabled_count.load(Ordering::Relaxed), 2);
        assert_eq!(disabled_count.load(Ordering::Relaxed), 0);
    }
}
