//! Runs one chroot lifecycle command end to end: lock, bring the backing stack up, create or
//! upgrade the chroot and finally act on it.

use std::{cell::Cell, path::PathBuf, time::Duration};

use log::{debug, info, warn};
use nix::sched::{unshare, CloneFlags};
use serde::Serialize;

use osutils::{
    dependencies::{CommandRunner, Dependency, DependencyResultExt},
    mount::MountManager,
};
use sdk_api::error::{
    ContentionError, EnvironmentError, ErrorKind, ReportError, SdkError, SdkResultExt,
    SetupError, StorageError, ToolError, VersionError,
};

use crate::{
    backend::ChrootBackend,
    config::{ChrootPaths, SdkConfig},
    creator::{is_chroot_dir_valid, ChrootCreator},
    lock::{ChrootLock, LockMode},
    mounts::ChrootMounter,
    snapshot::SnapshotManager,
    validation::HostUser,
    version::ChrootUpdater,
};

/// Tarball used by `create` when none is configured, relative to the cache directory.
const DEFAULT_SDK_TARBALL: &str = "sdks/cros-sdk-latest.tar.xz";

/// What `version` prints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionReport {
    pub chroot: PathBuf,
    /// `None` while the chroot is missing or not yet initialized.
    pub version: Option<u32>,
    pub latest: u32,
    /// Upgrade hooks the next `enter` would run.
    pub pending: Vec<String>,
}

pub struct Driver<'a> {
    runner: &'a dyn CommandRunner,
    config: SdkConfig,
    paths: ChrootPaths,
    user: HostUser,
    /// Whether to move into a private mount namespace before touching the chroot's own mounts.
    isolate: bool,
    paths_mounted: Cell<bool>,
}

impl<'a> Driver<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: SdkConfig, user: HostUser) -> Self {
        Self {
            runner,
            paths: config.paths(),
            config,
            user,
            isolate: true,
            paths_mounted: Cell::new(false),
        }
    }

    /// Keeps the chroot's auxiliary mounts in the caller's mount namespace.
    pub fn without_isolation(self) -> Self {
        Self {
            isolate: false,
            ..self
        }
    }

    pub fn paths(&self) -> &ChrootPaths {
        &self.paths
    }

    fn backend(&self) -> ChrootBackend<'a> {
        ChrootBackend::new(self.runner, &self.config)
    }

    fn updater(&self) -> ChrootUpdater<'a> {
        ChrootUpdater::new(self.runner, &self.paths)
    }

    fn lock(&self, mode: LockMode) -> Result<ChrootLock, SdkError> {
        ChrootLock::acquire(
            &self.paths.lock,
            mode,
            Duration::from_secs(self.config.lock_timeout_secs),
        )
    }

    /// Creates the chroot. With `replace`, an existing one is deleted first.
    pub fn create(&self, replace: bool, use_prebuilts: bool) -> Result<(), SdkError> {
        let _lock = self.lock(LockMode::Write)?;
        if replace {
            info!("Replacing chroot '{}'", self.paths.chroot.display());
            self.backend()
                .cleanup(true)
                .message("Failed to delete the existing chroot")?;
        } else if self.backend().mount_chroot(false)? && self.updater().is_initialized() {
            return Err(SdkError::new(SetupError::AlreadyExists {
                path: self.paths.chroot.display().to_string(),
            }));
        }
        self.create_locked(use_prebuilts)
    }

    fn create_locked(&self, use_prebuilts: bool) -> Result<(), SdkError> {
        let tarball = self
            .config
            .sdk_tarball
            .clone()
            .unwrap_or_else(|| self.paths.cache_dir.join(DEFAULT_SDK_TARBALL));
        if !tarball.exists() {
            return Err(SdkError::new(SetupError::MissingTarball {
                path: tarball.display().to_string(),
            }));
        }

        self.backend().mount_chroot(true)?;
        self.isolate_mounts()?;
        ChrootCreator::new(self.runner, &self.config, &tarball)
            .with_prebuilts(use_prebuilts)
            .run(
                &self.user.name,
                self.user.uid,
                &self.user.group,
                self.user.gid,
            )?;
        self.paths_mounted.set(true);
        if !is_chroot_dir_valid(&self.paths.chroot, 0)? {
            warn!("Continuing with a chroot whose ownership looks wrong");
        }

        let updater = self.updater();
        let latest = updater.latest_version()?;
        updater.set_version(latest)?;
        info!("Chroot is at version {latest}");
        Ok(())
    }

    /// Enters the chroot as the invoking user, running `command` or a login shell. A missing
    /// chroot is created first and an outdated one upgraded.
    pub fn enter(&self, command: &[String], use_prebuilts: bool) -> Result<(), SdkError> {
        let lock = self.lock(LockMode::Write)?;
        if self.backend().mount_chroot(false)? && self.updater().is_initialized() {
            self.isolate_mounts()?;
            self.mount_chroot_paths()?;
            self.updater()
                .apply_updates()
                .message("Failed to upgrade the chroot")?;
        } else {
            info!(
                "No usable chroot at '{}', creating it",
                self.paths.chroot.display()
            );
            self.create_locked(use_prebuilts)?;
        }
        drop(lock);
        let _lock = self.lock(LockMode::Read)?;

        let mut cmd = Dependency::Chroot.cmd();
        cmd.arg("--userspec")
            .arg(format!("{}:{}", self.user.uid, self.user.gid))
            .arg(&self.paths.chroot);
        if command.is_empty() {
            cmd.args(["/bin/bash", "-l"]);
        } else {
            cmd.args(command);
        }

        debug!("Entering chroot with '{}'", cmd.render_command());
        let status = self
            .runner
            .execute_interactive(&cmd)
            .message("Failed to enter the chroot")?;
        if !status.success() {
            return Err(SdkError::new(ToolError::CommandFailed {
                binary: Dependency::Chroot.name(),
                explanation: format!("Command inside the chroot exited with {status}"),
            }));
        }
        Ok(())
    }

    /// Deletes the chroot and its backing image. `force` proceeds without the lock when it
    /// cannot be taken in time.
    pub fn delete(&self, force: bool) -> Result<(), SdkError> {
        let _lock = match self.lock(LockMode::Write) {
            Ok(lock) => Some(lock),
            Err(e)
                if force
                    && matches!(
                        e.kind(),
                        ErrorKind::Contention(ContentionError::LockTimeout { .. })
                    ) =>
            {
                warn!("{}, deleting anyway", e.kind());
                None
            }
            Err(e) => return Err(e),
        };
        self.backend().cleanup(true)
    }

    /// Unmounts the chroot and detaches its backing stack, keeping the image.
    pub fn unmount(&self) -> Result<(), SdkError> {
        let _lock = self.lock(LockMode::Write)?;
        self.backend().cleanup(false)
    }

    pub fn snapshot_create(&self, name: &str) -> Result<(), SdkError> {
        let _lock = self.lock(LockMode::Write)?;
        self.snapshots()?.create(name)
    }

    /// Lists snapshots. The storage stack is brought up under the write lock, then the listing
    /// itself runs under a shared one.
    pub fn snapshot_list(&self) -> Result<Vec<String>, SdkError> {
        let lock = self.lock(LockMode::Write)?;
        let snapshots = self.snapshots()?;
        drop(lock);
        let _lock = self.lock(LockMode::Read)?;
        snapshots.list()
    }

    pub fn snapshot_delete(&self, name: &str) -> Result<(), SdkError> {
        let _lock = self.lock(LockMode::Write)?;
        self.snapshots()?.delete(name)
    }

    /// Replaces the chroot with snapshot `name` and mounts the result.
    pub fn snapshot_restore(&self, name: &str) -> Result<(), SdkError> {
        let _lock = self.lock(LockMode::Write)?;
        let snapshots = self.snapshots()?;
        let unknown = || {
            SdkError::new(StorageError::UnknownSnapshot {
                name: name.to_string(),
            })
        };
        if !snapshots.list()?.iter().any(|snapshot| snapshot == name) {
            return Err(unknown());
        }

        let backend = self.backend();
        if backend.is_mounted()? {
            MountManager::new(self.runner).umount(&self.paths.chroot, true)?;
        }
        if !snapshots.restore(name)? {
            return Err(unknown());
        }
        if !backend.mount_chroot(false)? {
            return Err(SdkError::new(StorageError::MissingChroot {
                path: self.paths.chroot.display().to_string(),
            }))
            .message("Restored chroot could not be mounted");
        }
        info!("Restored chroot from snapshot '{name}'");
        Ok(())
    }

    /// Discards unused blocks of the mounted chroot.
    pub fn fstrim(&self) -> Result<String, SdkError> {
        let _lock = self.lock(LockMode::Write)?;
        self.backend().trim()
    }

    pub fn version(&self) -> Result<VersionReport, SdkError> {
        let lock = self.lock(LockMode::Write)?;
        self.backend().mount_chroot(false)?;
        drop(lock);
        let _lock = self.lock(LockMode::Read)?;

        let updater = self.updater();
        let version = match updater.get_version() {
            Ok(version) => Some(version),
            Err(e) if matches!(e.kind(), ErrorKind::Version(VersionError::Uninitialized { .. })) => {
                None
            }
            Err(e) => return Err(e),
        };
        let pending = match version {
            Some(_) => updater
                .pending_updates()?
                .into_iter()
                .filter_map(|(_, hook)| {
                    hook.file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(VersionReport {
            chroot: self.paths.chroot.clone(),
            version,
            latest: updater.latest_version()?,
            pending,
        })
    }

    /// Mounts the chroot if needed and returns a snapshot manager for its volume group.
    fn snapshots(&self) -> Result<SnapshotManager<'a>, SdkError> {
        let missing = || StorageError::MissingChroot {
            path: self.paths.chroot.display().to_string(),
        };
        let backend = self.backend();
        if !backend.mount_chroot(false)? {
            return Err(SdkError::new(missing()));
        }
        let vg = backend.find_volume_group()?.structured(missing())?;
        Ok(SnapshotManager::new(
            self.runner,
            vg,
            &self.config.host.dev_dir,
        ))
    }

    /// Moves this process into a private mount namespace, once.
    fn isolate_mounts(&self) -> Result<(), SdkError> {
        if !self.isolate || self.paths_mounted.get() {
            return Ok(());
        }
        unshare(CloneFlags::CLONE_NEWNS).structured(EnvironmentError::MountNamespace)
    }

    fn mount_chroot_paths(&self) -> Result<(), SdkError> {
        if self.paths_mounted.get() {
            return Ok(());
        }
        ChrootMounter::new(self.runner, &self.paths, &self.config.host)
            .mount_chroot_paths(&self.paths.chroot)?;
        self.paths_mounted.set(true);
        Ok(())
    }
}
