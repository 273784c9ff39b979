use std::path::Path;

use sdk_api::error::SdkError;

use crate::dependencies::{CommandRunner, Dependency, DependencyResultExt};

/// Discards unused blocks of the filesystem mounted at `mount_point`, returning fstrim's summary.
pub fn trim(runner: &dyn CommandRunner, mount_point: impl AsRef<Path>) -> Result<String, SdkError> {
    let output = Dependency::Fstrim
        .cmd()
        .with_arg("-v")
        .with_arg(mount_point.as_ref())
        .output_and_check(runner)
        .message(format!(
            "Failed to trim '{}'",
            mount_point.as_ref().display()
        ))?;
    Ok(output.trim().to_string())
}
