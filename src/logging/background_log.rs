use std::{fs::File, io::Write, path::Path, sync::Mutex};

use log::{LevelFilter, Log, Metadata, Record};

use super::LogEntry;

/// Writes records as JSON lines to a file.
///
/// Logging must never fail the agent: if the file cannot be created the
/// logger disables itself, and write errors are dropped.
pub struct BackgroundLog {
    file: Option<Mutex<File>>,
    max_level: LevelFilter,
}

impl BackgroundLog {
    /// Creates the log file at `path`, truncating an existing one.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let file = match File::create(path.as_ref()) {
            Ok(file) => Some(Mutex::new(file)),
            Err(err) => {
                eprintln!(
                    "Logging setup error: failed to create log file '{}': {err}",
                    path.as_ref().display()
                );
                None
            }
        };

        Self {
            file,
            max_level: LevelFilter::Trace,
        }
    }

    pub fn with_max_level(self, max_level: LevelFilter) -> Self {
        Self { max_level, ..self }
    }

    pub fn into_logger(self) -> Box<dyn Log> {
        Box::new(self)
    }

    fn write_entry(&self, record: &Record) -> Result<(), Box<dyn std::error::Error + '_>> {
        let Some(file) = self.file.as_ref() else {
            return Ok(());
        };

        let mut line = serde_json::to_string(&LogEntry::from(record))?;
        line.push('\n');
        let mut file = file.lock()?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

impl Log for BackgroundLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.file.is_some() && metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        let _ = self.write_entry(record);
    }

    fn flush(&self) {
        if let Some(Ok(mut file)) = self.file.as_ref().map(Mutex::lock) {
            let _ = file.flush();
        }
    }
}
