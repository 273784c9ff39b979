use std::path::Path;

use anyhow::{bail, Context, Error};
use log::{debug, error};

use sdk_api::error::{ContentionError, ReportError, SdkError};

use crate::{
    dependencies::{CommandRunner, Dependency, DependencyResultExt},
    diagnostics, files,
    filesystems::MountFileSystemType,
};

/// Wraps the `mount`/`umount` tool family.
pub struct MountManager<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> MountManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// Mounts `source` at `target` with the given filesystem type and options.
    pub fn mount(
        &self,
        source: impl AsRef<Path>,
        target: impl AsRef<Path>,
        filesystem: MountFileSystemType,
        options: &[&str],
    ) -> Result<(), SdkError> {
        let mut cmd = Dependency::Mount.cmd();
        cmd.arg("-t").arg(filesystem.name());
        if !options.is_empty() {
            cmd.arg("-o").arg(options.join(","));
        }
        cmd.arg(source.as_ref())
            .arg(target.as_ref())
            .run_and_check(self.runner)
            .message(format!(
                "Failed to mount {} to path {}",
                source.as_ref().display(),
                target.as_ref().display(),
            ))
    }

    pub fn bind(&self, source: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<(), SdkError> {
        self.bind_with(source.as_ref(), target.as_ref(), "--bind")
    }

    /// Bind mounts `source` at `target` including all of its sub-mounts.
    pub fn rbind(&self, source: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<(), SdkError> {
        self.bind_with(source.as_ref(), target.as_ref(), "--rbind")
    }

    fn bind_with(&self, source: &Path, target: &Path, flag: &str) -> Result<(), SdkError> {
        Dependency::Mount
            .cmd()
            .with_arg(flag)
            .with_arg(source)
            .with_arg(target)
            .run_and_check(self.runner)
            .message(format!(
                "Failed to mount {} as a bind mount for {}",
                source.display(),
                target.display(),
            ))
    }

    /// Recursively marks `target` as a slave, so unmounts from the parent namespace propagate in
    /// but new mounts below it do not propagate out.
    pub fn make_rslave(&self, target: impl AsRef<Path>) -> Result<(), SdkError> {
        self.propagation(target.as_ref(), "--make-rslave")
    }

    pub fn make_private(&self, target: impl AsRef<Path>) -> Result<(), SdkError> {
        self.propagation(target.as_ref(), "--make-private")
    }

    fn propagation(&self, target: &Path, flag: &str) -> Result<(), SdkError> {
        Dependency::Mount
            .cmd()
            .with_arg(flag)
            .with_arg(target)
            .run_and_check(self.runner)
            .message(format!(
                "Failed to change propagation of {} with {flag}",
                target.display(),
            ))
    }

    /// Unmounts `target`. When that fails, the error carries the output of `fuser`, `lsof` and
    /// `ps` so that whoever keeps the mount busy can be found.
    pub fn umount(&self, target: impl AsRef<Path>, recursive: bool) -> Result<(), SdkError> {
        let target = target.as_ref();
        let mut cmd = Dependency::Umount.cmd();
        if recursive {
            cmd.arg("-R");
        }
        cmd.arg(target);

        if let Err(e) = cmd.run_and_check(self.runner) {
            let diagnostics = diagnostics::busy_report(self.runner, target);
            error!("Failed to unmount '{}':\n{diagnostics}", target.display());
            return Err::<(), _>(*e).structured(ContentionError::MountBusy {
                path: target.display().to_string(),
                diagnostics,
            });
        }

        debug!("Unmounted '{}'", target.display());
        Ok(())
    }
}

/// Ensures that `target_path` can be used as a mount point, creating it when missing.
pub fn ensure_mount_directory(target_path: &Path) -> Result<(), Error> {
    if target_path.exists() {
        if !target_path.is_dir() {
            bail!("Mount path '{}' is not a directory", target_path.display());
        }
    } else {
        files::create_dirs(target_path).context(format!(
            "Failed to create mount path '{}'",
            target_path.display()
        ))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::File;

    use sdk_api::error::ErrorKind;
    use tempfile::TempDir;

    use crate::testutils::mock::{MockCommandInput, MockCommandOutput, MockCommandRunner};

    #[test]
    fn test_mount_args() {
        let runner = MockCommandRunner::new();
        runner.expect_success(
            Dependency::Mount,
            &["-t", "proc", "-o", "nosuid,nodev", "proc", "/c/proc"],
        );
        runner.expect_success(Dependency::Mount, &["-t", "ext4", "/dev/vg/lv", "/c"]);
        runner.expect_success(Dependency::Mount, &["--rbind", "/dev", "/c/dev"]);
        runner.expect_success(Dependency::Mount, &["--make-rslave", "/"]);

        let mounts = MountManager::new(&runner);
        mounts
            .mount(
                "proc",
                "/c/proc",
                MountFileSystemType::Proc,
                &["nosuid", "nodev"],
            )
            .unwrap();
        mounts
            .mount("/dev/vg/lv", "/c", MountFileSystemType::Ext4, &[])
            .unwrap();
        mounts.rbind("/dev", "/c/dev").unwrap();
        mounts.make_rslave("/").unwrap();
    }

    #[test]
    fn test_umount_busy_collects_diagnostics() {
        let runner = MockCommandRunner::new();
        runner.add_expectation(
            MockCommandInput::new(Dependency::Umount, &["-R", "/c"]),
            MockCommandOutput::new(32, "", "umount: /c: target is busy.\n"),
        );
        runner.add_expectation(
            MockCommandInput::new(Dependency::Fuser, &["-vm", "/c"]),
            MockCommandOutput::new(0, "", "/c: 4242c\n"),
        );
        runner.add_expectation(
            MockCommandInput::new(Dependency::Lsof, &["+D", "/c"]),
            MockCommandOutput::new(0, "bash 4242 cwd /c\n", ""),
        );
        runner.add_expectation(
            MockCommandInput::new(Dependency::Ps, &["auxf"]),
            MockCommandOutput::new(0, "root 4242 bash\n", ""),
        );

        let error = MountManager::new(&runner).umount("/c", true).unwrap_err();
        match error.kind() {
            ErrorKind::Contention(ContentionError::MountBusy { path, diagnostics }) => {
                assert_eq!(path, "/c");
                assert!(diagnostics.contains("/c: 4242c"));
                assert!(diagnostics.contains("bash 4242 cwd /c"));
                assert!(diagnostics.contains("root 4242 bash"));
            }
            kind => panic!("Unexpected error kind: {kind:?}"),
        }
        assert!(format!("{error:?}").contains("target is busy"));
    }

    #[test]
    fn test_ensure_mount_directory() {
        let temp_mount_dir = TempDir::new().unwrap();

        // Existing directory
        ensure_mount_directory(temp_mount_dir.path()).unwrap();

        // Missing directory gets created
        let temp_mount_point_dir = temp_mount_dir.path().join("mnt/host/source");
        ensure_mount_directory(&temp_mount_point_dir).unwrap();
        assert!(temp_mount_point_dir.exists());

        // Non-empty directory is fine
        ensure_mount_directory(temp_mount_dir.path()).unwrap();

        // A file is not
        let temp_mount_point_file = temp_mount_dir.path().join("temp_file");
        File::create(&temp_mount_point_file).unwrap();
        assert_eq!(
            ensure_mount_directory(&temp_mount_point_file)
                .unwrap_err()
                .to_string(),
            format!(
                "Mount path '{}' is not a directory",
                temp_mount_point_file.display()
            )
        );
    }
}
