use std::path::Path;

use sdk_api::error::SdkError;

use crate::dependencies::{CommandRunner, Dependency, DependencyResultExt};

/// Formats `device` as ext4 for use as a build scratch volume: no journal and no blocks reserved
/// for root.
pub fn format_scratch_ext4(
    runner: &dyn CommandRunner,
    device: impl AsRef<Path>,
) -> Result<(), SdkError> {
    Dependency::Mke2fs
        .cmd()
        .with_args(["-q", "-m", "0", "-t", "ext4", "-O", "^has_journal"])
        .with_arg(device.as_ref())
        .run_and_check(runner)
        .message(format!(
            "Failed to format '{}' as ext4",
            device.as_ref().display()
        ))
}
