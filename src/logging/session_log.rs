use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::Mutex,
};

use anyhow::{Context, Error};
use log::{LevelFilter, Log, Record};
use uuid::Uuid;

use osutils::files;

use super::LogEntry;

/// Appends every record as a JSON line to a file shared by all invocations.
pub struct SessionLog {
    target: Option<Mutex<File>>,
    session: Uuid,
    max_level: LevelFilter,
}

impl SessionLog {
    pub fn new(target: impl AsRef<Path>) -> Self {
        let file = match open_append(target.as_ref()) {
            Ok(f) => Some(Mutex::new(f)),
            Err(err) => {
                eprintln!("Logging setup error: failed to open session log file: {err:?}");
                None
            }
        };

        Self {
            target: file,
            session: Uuid::new_v4(),
            max_level: LevelFilter::Trace,
        }
    }

    pub fn with_max_level(self, max_level: LevelFilter) -> Self {
        Self { max_level, ..self }
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn into_logger(self) -> Box<dyn Log> {
        Box::new(self)
    }

    /// Best effort attempt to write the log entry to the file
    fn write_entry(&self, record: &Record) -> Result<(), Box<dyn std::error::Error + '_>> {
        if let Some(file) = self.target.as_ref() {
            let mut serialized = serde_json::to_string(&LogEntry::new(record, self.session))?;
            serialized.push('\n');

            let mut file_lock = file.lock()?;
            file_lock.write_all(serialized.as_bytes())?;
        }

        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File, Error> {
    if let Some(parent) = path.parent() {
        files::create_dirs(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(format!("Could not open file: {}", path.display()))
}

impl Log for SessionLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.target.is_some() && metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        let _ = self.write_entry(record);
    }

    fn flush(&self) {
        if let Some(file) = self.target.as_ref() {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}
