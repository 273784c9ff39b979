use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub(super) mod multilog;
pub(super) mod session_log;

/// One line of the session log.
#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// Identifies the invocation, several of which may append to the same file.
    pub session: Uuid,
    pub level: Level,
    pub message: String,
    pub target: String,
    pub module: String,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl From<log::Level> for Level {
    fn from(value: log::Level) -> Self {
        match value {
            log::Level::Error => Level::Error,
            log::Level::Warn => Level::Warn,
            log::Level::Info => Level::Info,
            log::Level::Debug => Level::Debug,
            log::Level::Trace => Level::Trace,
        }
    }
}

impl LogEntry {
    fn new(record: &log::Record, session: Uuid) -> Self {
        Self {
            timestamp: Utc::now(),
            session,
            level: record.level().into(),
            message: record.args().to_string(),
            target: record.target().to_string(),
            module: record.module_path().unwrap_or_default().to_string(),
            file: record.file().unwrap_or_default().to_string(),
            line: record.line().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry() {
        let session = Uuid::new_v4();
        let before = Utc::now();
        let entry = LogEntry::new(
            &log::Record::builder()
                .args(format_args!("Mounted '/dev/vg/chroot'"))
                .level(log::Level::Info)
                .target("cros_sdk::backend")
                .module_path(Some("cros_sdk::backend"))
                .file(Some("src/backend.rs"))
                .line(Some(1))
                .build(),
            session,
        );

        assert!(entry.timestamp >= before);
        assert_eq!(entry.session, session);
        assert_eq!(entry.level, Level::Info);
        assert_eq!(entry.message, "Mounted '/dev/vg/chroot'");
        assert_eq!(entry.target, "cros_sdk::backend");
        assert_eq!(entry.module, "cros_sdk::backend");
        assert_eq!(entry.file, "src/backend.rs");
        assert_eq!(entry.line, 1);
    }
}
