use log::{LevelFilter, Log, Metadata, Record};

/// Caps the level of every record whose target is `target` or lies below it.
struct TargetFilter {
    target: String,
    max_level: LevelFilter,
}

impl TargetFilter {
    fn matches(&self, target: &str) -> bool {
        target
            .strip_prefix(self.target.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
    }
}

/// A logger that hands every record to a list of loggers.
pub struct MultiLogger {
    loggers: Vec<Box<dyn Log>>,
    max_level: LevelFilter,
    filters: Vec<TargetFilter>,
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
            filters: Vec::new(),
        }
    }

    pub fn with_logger(mut self, logger: Box<dyn Log>) -> Self {
        self.loggers.push(logger);
        self
    }

    /// Sets the global max level once the logger is installed.
    pub fn with_max_level(mut self, max_level: LevelFilter) -> Self {
        self.max_level = max_level;
        self
    }

    /// Drops records of `target` and its submodules that are more verbose
    /// than `max_level`, for all loggers.
    pub fn with_global_filter(mut self, target: impl Into<String>, max_level: LevelFilter) -> Self {
        self.filters.push(TargetFilter {
            target: target.into(),
            max_level,
        });
        self
    }

    pub fn add_logger(&mut self, logger: Box<dyn Log>) {
        self.loggers.push(logger);
    }

    /// Installs this logger as the global logger.
    pub fn init(self) -> Result<(), log::SetLoggerError> {
        log::set_max_level(self.max_level);
        log::set_boxed_logger(Box::new(self))
    }

    fn filtered(&self, metadata: &Metadata) -> bool {
        self.filters
            .iter()
            .any(|filter| filter.matches(metadata.target()) && metadata.level() > filter.max_level)
    }
}

impl Log for MultiLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        !self.filtered(metadata) && self.loggers.iter().any(|logger| logger.enabled(metadata))
    }

    fn log(&self, record: &Record) {
        if self.filtered(record.metadata()) {
            return;
        }
        for logger in &self.loggers {
            if logger.enabled(record.metadata()) {
                logger.log(record);
            }
        }
    }

    fn flush(&self) {
        self.loggers.iter().for_each(|logger| logger.flush());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    use log::Level;

    /// Collects the messages it receives up to its level.
    struct Collector {
        level: LevelFilter,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Collector {
        fn new(level: LevelFilter) -> (Box<dyn Log>, Arc<Mutex<Vec<String>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Box::new(Self {
                    level,
                    seen: seen.clone(),
                }),
                seen,
            )
        }
    }

    impl Log for Collector {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= self.level
        }

        fn log(&self, record: &Record) {
            self.seen.lock().unwrap().push(record.args().to_string());
        }

        fn flush(&self) {}
    }

    fn send(logger: &MultiLogger, target: &str, level: Level, message: &str) {
        logger.log(
            &Record::builder()
                .args(format_args!("{message}"))
                .target(target)
                .level(level)
                .build(),
        );
    }

    #[test]
    fn test_fan_out() {
        let (verbose, verbose_seen) = Collector::new(LevelFilter::Trace);
        let (quiet, quiet_seen) = Collector::new(LevelFilter::Warn);
        let logger = MultiLogger::new().with_logger(verbose).with_logger(quiet);

        send(&logger, "blockgraph::prober", Level::Debug, "pass 1a");
        send(&logger, "blockgraph::planner", Level::Error, "cycle");

        assert_eq!(*verbose_seen.lock().unwrap(), vec!["pass 1a", "cycle"]);
        assert_eq!(*quiet_seen.lock().unwrap(), vec!["cycle"]);
        assert!(logger.enabled(&Metadata::builder().level(Level::Trace).build()));
    }

    #[test]
    fn test_no_logger_enabled() {
        let (quiet, _) = Collector::new(LevelFilter::Off);
        let logger = MultiLogger::new().with_logger(quiet);
        assert!(!logger.enabled(&Metadata::builder().level(Level::Error).build()));
        assert!(!MultiLogger::new().enabled(&Metadata::builder().level(Level::Error).build()));
    }

    #[test]
    fn test_global_filter() {
        let (collector, seen) = Collector::new(LevelFilter::Trace);
        let logger = MultiLogger::new()
            .with_logger(collector)
            .with_global_filter("osutils", LevelFilter::Info);

        send(&logger, "osutils::lsblk", Level::Trace, "lsblk output");
        send(&logger, "osutils::mdadm", Level::Debug, "mdadm output");
        send(&logger, "osutils::mdadm", Level::Info, "assembled");
        send(&logger, "osutils", Level::Debug, "root module");
        // Only whole path segments match.
        send(&logger, "osutils_extra", Level::Trace, "other crate");
        send(&logger, "blockgraph", Level::Trace, "graph dump");

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["assembled", "other crate", "graph dump"]
        );
        assert!(!logger.enabled(
            &Metadata::builder()
                .target("osutils::btrfs")
                .level(Level::Debug)
                .build()
        ));
    }
}
