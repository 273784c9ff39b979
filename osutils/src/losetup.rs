use std::path::{Path, PathBuf};

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use sdk_api::error::{ReportError, SdkError, SdkResultExt, ToolError};

use crate::dependencies::{CommandRunner, Dependency, DependencyResultExt};

/// `losetup -j` prints one association per line, e.g.
/// `/dev/loop3: [66306]:1838412 (/home/user/chroot.img)`.
static ASSOCIATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<device>/dev/loop\d+):").expect("association regex is valid")
});

/// Wraps `losetup`.
pub struct LoopbackManager<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> LoopbackManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// Finds a loop device already bound to `image`.
    pub fn find(&self, image: impl AsRef<Path>) -> Result<Option<PathBuf>, SdkError> {
        let output = Dependency::Losetup
            .cmd()
            .with_arg("-j")
            .with_arg(image.as_ref())
            .output_and_check(self.runner)
            .message(format!(
                "Failed to list loop devices bound to '{}'",
                image.as_ref().display()
            ))?;

        Ok(output
            .lines()
            .find_map(|line| ASSOCIATION.captures(line.trim()))
            .map(|captures| PathBuf::from(&captures["device"])))
    }

    /// Binds `image` to the first free loop device and returns it.
    pub fn attach(&self, image: impl AsRef<Path>) -> Result<PathBuf, SdkError> {
        let output = Dependency::Losetup
            .cmd()
            .with_args(["--show", "-f"])
            .with_arg(image.as_ref())
            .output_and_check(self.runner)
            .message(format!(
                "Failed to attach '{}' to a loop device",
                image.as_ref().display()
            ))?;

        let device = output.trim();
        let device = (!device.is_empty())
            .then(|| PathBuf::from(device))
            .structured(ToolError::UnexpectedOutput {
                binary: Dependency::Losetup.name(),
            })
            .message("losetup did not print the new loop device")?;
        debug!("Attached '{}' to '{}'", image.as_ref().display(), device.display());
        Ok(device)
    }

    pub fn detach(&self, device: impl AsRef<Path>) -> Result<(), SdkError> {
        Dependency::Losetup
            .cmd()
            .with_arg("-d")
            .with_arg(device.as_ref())
            .run_and_check(self.runner)
            .message(format!(
                "Failed to detach loop device '{}'",
                device.as_ref().display()
            ))
    }
}
