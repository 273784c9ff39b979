pub mod backend;
pub mod cli;
pub mod config;
pub mod creator;
pub mod lock;
mod logging;
pub mod mounts;
pub mod orchestrate;
pub mod snapshot;
pub mod validation;
pub mod version;

pub use logging::{multilog::MultiLogger, session_log::SessionLog};
pub use orchestrate::{Driver, VersionReport};

/// Version of this tool, reported by `--version` and logged at startup.
pub const CROS_SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
