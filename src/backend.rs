//! The storage stack under a chroot: a sparse image file, attached to a loop device, holding a
//! volume group with a thin pool and a thin `chroot` volume formatted as ext4.

use std::{
    io::ErrorKind as IoErrorKind,
    path::{Path, PathBuf},
    thread,
};

use log::{debug, info, warn};

use osutils::{
    dependencies::CommandRunner,
    files, fstrim,
    filesystems::MountFileSystemType,
    losetup::LoopbackManager,
    lvm::{self, VolumeManager},
    mke2fs,
    mount::MountManager,
    proc_mounts::MountTable,
};
use sdk_api::{
    constants::{
        CHROOT_LV_NAME, CHROOT_LV_SIZE, CHROOT_THINPOOL_NAME, CHROOT_VG_PATH_SUFFIX_LEN,
        CHROOT_VG_PREFIX, THINPOOL_SIZE,
    },
    error::{ReportError, SdkError, SetupError, StorageError},
};

use crate::config::{ChrootPaths, HostPaths, RetryPolicy, SdkConfig};

/// Highest volume group index tried before giving up.
const MAX_VG_INDEX: u32 = 999;

/// Name of the `index`th candidate volume group for `chroot`.
///
/// Only the tail of the path is used so that the name stays within LVM's limits, with every
/// character LVM might reject replaced by `+`.
pub fn vg_name(chroot: &Path, index: u32) -> String {
    let path = chroot.to_string_lossy();
    let chars = path.chars().collect::<Vec<_>>();
    let suffix = chars[chars.len().saturating_sub(CHROOT_VG_PATH_SUFFIX_LEN)..]
        .iter()
        .map(|c| if c.is_ascii_alphanumeric() { *c } else { '+' })
        .collect::<String>();
    format!("{CHROOT_VG_PREFIX}_{suffix}_{index:03}")
}

pub struct ChrootBackend<'a> {
    runner: &'a dyn CommandRunner,
    paths: ChrootPaths,
    image_size: u64,
    host: HostPaths,
    retry: RetryPolicy,
}

impl<'a> ChrootBackend<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &SdkConfig) -> Self {
        Self {
            runner,
            paths: config.paths(),
            image_size: config.image_size_bytes,
            host: config.host.clone(),
            retry: config.retry.clone(),
        }
    }

    pub fn volumes(&self) -> VolumeManager<'a> {
        VolumeManager::with_dev_dir(self.runner, &self.host.dev_dir)
    }

    /// Creates the sparse backing image. Returns whether it had to be created.
    pub fn ensure_backing_file(&self) -> Result<bool, SdkError> {
        let created = files::create_sparse_file(&self.paths.image, self.image_size).structured(
            StorageError::BackingFile {
                path: self.paths.image.display().to_string(),
            },
        )?;
        if created {
            info!(
                "Created backing image '{}' ({} bytes)",
                self.paths.image.display(),
                self.image_size
            );
        }
        Ok(created)
    }

    /// Returns the loop device bound to the image, attaching one if needed.
    pub fn attach_loopback(&self) -> Result<PathBuf, SdkError> {
        let loopback = LoopbackManager::new(self.runner);
        if let Some(device) = loopback.find(&self.paths.image)? {
            debug!(
                "Image '{}' is already attached to '{}'",
                self.paths.image.display(),
                device.display()
            );
            return Ok(device);
        }

        let device = loopback.attach(&self.paths.image)?;
        // LVM does not notice new loop devices on its own.
        self.volumes().pvscan_cache(Some(&device))?;
        Ok(device)
    }

    /// Finds or creates the volume group on `device` and makes sure it is active.
    pub fn ensure_volume_group(&self, device: &Path) -> Result<String, SdkError> {
        let volumes = self.volumes();
        let groups = volumes.volume_groups()?;

        let device_name = device.to_string_lossy();
        if let Some((vg, _)) = groups.iter().find(|(_, pv)| *pv == device_name) {
            debug!("Reusing volume group '{vg}' on '{}'", device.display());
            self.activate_with_retries(vg)?;
            return Ok(vg.clone());
        }

        let vg = (0..=MAX_VG_INDEX)
            .map(|index| vg_name(&self.paths.chroot, index))
            .find(|candidate| groups.iter().all(|(vg, _)| vg != candidate))
            .structured(StorageError::VolumeGroupNames {
                chroot: self.paths.chroot.display().to_string(),
            })?;
        info!("Creating volume group '{vg}' on '{}'", device.display());
        volumes.create_vg(&vg, device)?;
        Ok(vg)
    }

    fn activate_with_retries(&self, vg: &str) -> Result<(), SdkError> {
        let volumes = self.volumes();
        let attempts = self.retry.vg_activation_attempts.max(1);
        for attempt in 1..=attempts {
            match volumes.activate_vg(vg) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!("Activating volume group '{vg}' failed (attempt {attempt}/{attempts}): {e:?}");
                    thread::sleep(self.retry.delay());
                }
                Err(e) => return Err(e),
            }
        }
        Err(SdkError::internal("Volume group activation loop exited"))
    }

    /// Creates the thin pool and the formatted `chroot` volume unless they already exist.
    pub fn ensure_thin_pool_and_lv(&self, vg: &str) -> Result<(), SdkError> {
        let volumes = self.volumes();
        if volumes.lv_exists(vg, CHROOT_LV_NAME)? {
            debug!("Logical volume '{vg}/{CHROOT_LV_NAME}' already exists");
            return Ok(());
        }

        volumes.create_thin_pool_and_lv(
            vg,
            CHROOT_THINPOOL_NAME,
            THINPOOL_SIZE,
            CHROOT_LV_NAME,
            CHROOT_LV_SIZE,
        )?;
        let device = volumes.lv_path(vg, CHROOT_LV_NAME);
        self.wait_for_device(&device)?;
        mke2fs::format_scratch_ext4(self.runner, device)
    }

    /// Mounts the `chroot` volume of `vg` on the chroot directory.
    pub fn mount(&self, vg: &str) -> Result<(), SdkError> {
        let device = self.volumes().lv_path(vg, CHROOT_LV_NAME);
        self.wait_for_device(&device)?;

        files::create_dirs(&self.paths.chroot)
            .structured(SetupError::Populate {
                step: "create chroot directory",
            })?;
        MountManager::new(self.runner).mount(
            &device,
            &self.paths.chroot,
            MountFileSystemType::Ext4,
            &["noatime"],
        )?;
        info!(
            "Mounted '{}' on '{}'",
            device.display(),
            self.paths.chroot.display()
        );
        Ok(())
    }

    fn wait_for_device(&self, device: &Path) -> Result<(), SdkError> {
        for attempt in 1..=self.retry.device_wait_attempts.max(1) {
            if device.exists() {
                return Ok(());
            }
            debug!(
                "Waiting for '{}' to appear (attempt {attempt})",
                device.display()
            );
            thread::sleep(self.retry.delay());
        }
        if device.exists() {
            return Ok(());
        }
        Err(SdkError::new(StorageError::DeviceNodeMissing {
            device: device.display().to_string(),
        }))
    }

    fn mount_table(&self) -> Result<MountTable, SdkError> {
        MountTable::read(&self.host.mount_table).structured(StorageError::MountTable {
            path: self.host.mount_table.display().to_string(),
        })
    }

    pub fn is_mounted(&self) -> Result<bool, SdkError> {
        Ok(self.mount_table()?.is_mounted(&self.paths.chroot))
    }

    /// The `(vg, lv)` mounted on the chroot directory, if it is one of ours.
    pub fn find_mount_source(&self) -> Result<Option<(String, String)>, SdkError> {
        let table = self.mount_table()?;
        let Some(entry) = table.find(&self.paths.chroot) else {
            return Ok(None);
        };
        Ok(entry
            .source
            .strip_prefix("/dev/mapper/")
            .and_then(lvm::parse_mapper_name)
            .filter(|(vg, _)| vg.starts_with(&format!("{CHROOT_VG_PREFIX}_"))))
    }

    /// The volume group backing the chroot, whether or not it is mounted.
    pub fn find_volume_group(&self) -> Result<Option<String>, SdkError> {
        if let Some((vg, _)) = self.find_mount_source()? {
            return Ok(Some(vg));
        }
        if !self.paths.image.exists() {
            return Ok(None);
        }
        match LoopbackManager::new(self.runner).find(&self.paths.image)? {
            Some(device) => self.volumes().vg_for_device(device),
            None => Ok(None),
        }
    }

    /// Brings the whole stack up and mounts the chroot. Returns false when there is no image and
    /// `create` is not set.
    pub fn mount_chroot(&self, create: bool) -> Result<bool, SdkError> {
        if self.is_mounted()? {
            debug!("Chroot '{}' is already mounted", self.paths.chroot.display());
            return Ok(true);
        }
        if !create && !self.paths.image.exists() {
            debug!(
                "No backing image at '{}', not creating one",
                self.paths.image.display()
            );
            return Ok(false);
        }

        self.ensure_backing_file()?;
        let device = self.attach_loopback()?;
        let vg = self.ensure_volume_group(&device)?;
        self.ensure_thin_pool_and_lv(&vg)?;
        self.mount(&vg)?;
        Ok(true)
    }

    /// Tears the stack down. Every step skips what is already gone, so this can be rerun after a
    /// partial failure.
    pub fn cleanup(&self, delete: bool) -> Result<(), SdkError> {
        let chroot = &self.paths.chroot;
        let mounted_vg = self.find_mount_source()?.map(|(vg, _)| vg);

        if !self.mount_table()?.submounts(chroot).is_empty() {
            MountManager::new(self.runner).umount(chroot, true)?;
        }

        let loopback = LoopbackManager::new(self.runner);
        let device = if self.paths.image.exists() {
            loopback.find(&self.paths.image)?
        } else {
            None
        };

        let volumes = self.volumes();
        let vg = match &device {
            Some(device) => volumes.vg_for_device(device)?.or(mounted_vg),
            None => mounted_vg,
        };
        if let Some(vg) = vg {
            volumes.deactivate_vg(&vg)?;
        }

        if let Some(device) = device {
            loopback.detach(&device)?;
            volumes.pvscan_cache(None)?;
        }

        if delete {
            self.remove_files()?;
        }
        Ok(())
    }

    fn remove_files(&self) -> Result<(), SdkError> {
        let remove_error = |path: &Path| StorageError::RemoveChroot {
            path: path.display().to_string(),
        };

        match std::fs::remove_file(&self.paths.image) {
            Err(e) if e.kind() != IoErrorKind::NotFound => {
                return Err(e).structured(remove_error(&self.paths.image));
            }
            _ => {}
        }
        match std::fs::remove_dir(&self.paths.chroot) {
            Err(e) if e.kind() != IoErrorKind::NotFound => {
                Err(e).structured(remove_error(&self.paths.chroot))
            }
            _ => {
                info!("Removed chroot '{}'", self.paths.chroot.display());
                Ok(())
            }
        }
    }

    /// Gives blocks freed inside the chroot back to the host.
    pub fn trim(&self) -> Result<String, SdkError> {
        if !self.is_mounted()? {
            return Err(SdkError::new(StorageError::NotMounted {
                path: self.paths.chroot.display().to_string(),
            }));
        }
        let summary = fstrim::trim(self.runner, &self.paths.chroot)?;
        info!("{summary}");
        Ok(summary)
    }
}

#[cfg(test)]
pub(crate) fn test_config(root: &Path, host: &osutils::testutils::fake_host::FakeHost) -> SdkConfig {
    SdkConfig {
        source_root: root.join("src"),
        chroot: Some(root.join("chroot")),
        image_size_bytes: 1024 * 1024,
        host: HostPaths {
            mount_table: host.mounts_file().to_owned(),
            dev_dir: host.dev_dir().to_owned(),
            proc_filesystems: root.join("filesystems"),
            etc_dir: root.join("host_etc"),
        },
        retry: RetryPolicy {
            delay_ms: 0,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use osutils::{dependencies::Dependency, testutils::fake_host::FakeHost};
    use sdk_api::error::{ContentionError, ErrorKind};

    #[test]
    fn test_vg_name() {
        assert_eq!(
            vg_name(Path::new("/home/user/chromiumos/chroot"), 0),
            "cros_+home+user+chromiumos+chroot_000"
        );
        assert_eq!(vg_name(Path::new("/a-b.c"), 12), "cros_+a+b+c_012");

        let long = PathBuf::from(format!("/{}/chroot", "x".repeat(200)));
        let name = vg_name(&long, 1);
        assert_eq!(
            name,
            format!("cros_{}+chroot_001", "x".repeat(CHROOT_VG_PATH_SUFFIX_LEN - 7))
        );
        assert_eq!(name, vg_name(&long, 1));
    }

    #[test]
    fn test_mount_chroot_creates_stack() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());
        let config = test_config(dir.path(), &host);
        let paths = config.paths();
        let backend = ChrootBackend::new(&host, &config);

        assert!(backend.mount_chroot(true).unwrap());

        let vg = vg_name(&paths.chroot, 0);
        assert_eq!(host.vg_names(), vec![vg.clone()]);
        assert_eq!(host.lv_names(&vg), vec!["chroot", "thinpool"]);
        assert_eq!(
            std::fs::metadata(&paths.image).unwrap().len(),
            1024 * 1024
        );
        assert_eq!(host.loop_devices().len(), 1);
        assert_eq!(host.calls_to(Dependency::Mke2fs).len(), 1);
        assert_eq!(
            host.calls_to(Dependency::Pvscan),
            vec![vec!["-q", "--cache", "/dev/loop0"]]
        );
        assert!(backend.is_mounted().unwrap());
        assert_eq!(
            backend.find_mount_source().unwrap(),
            Some((vg.clone(), "chroot".to_string()))
        );
        assert_eq!(backend.find_volume_group().unwrap(), Some(vg));
    }

    #[test]
    fn test_mount_chroot_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());
        let config = test_config(dir.path(), &host);
        let backend = ChrootBackend::new(&host, &config);

        assert!(backend.mount_chroot(true).unwrap());
        host.clear_calls();
        assert!(backend.mount_chroot(true).unwrap());
        assert!(backend.mount_chroot(false).unwrap());
        assert!(host.calls().is_empty());
        assert_eq!(host.mount_targets().len(), 1);
    }

    #[test]
    fn test_mount_chroot_without_image() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());
        let config = test_config(dir.path(), &host);
        let backend = ChrootBackend::new(&host, &config);

        assert!(!backend.mount_chroot(false).unwrap());
        assert!(host.calls().is_empty());
        assert!(!config.paths().image.exists());
    }

    #[test]
    fn test_remount_existing_image() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());
        let config = test_config(dir.path(), &host);
        let backend = ChrootBackend::new(&host, &config);

        backend.mount_chroot(true).unwrap();
        backend.cleanup(false).unwrap();
        assert!(host.loop_devices().is_empty());
        assert!(config.paths().image.exists());

        // The kernel hands the image the same device again, with its volume group on it.
        host.add_loop_device("/dev/loop0", config.paths().image);
        host.clear_calls();
        assert!(backend.mount_chroot(false).unwrap());

        let vg = vg_name(&config.paths().chroot, 0);
        assert!(host.calls_to(Dependency::Vgcreate).is_empty());
        assert!(host.calls_to(Dependency::Lvcreate).is_empty());
        assert_eq!(
            host.calls_to(Dependency::Vgchange),
            vec![vec!["-q", "-ay", vg.as_str()]]
        );
        assert!(backend.is_mounted().unwrap());
    }

    #[test]
    fn test_vg_reuse_by_device() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());
        let config = test_config(dir.path(), &host);
        let backend = ChrootBackend::new(&host, &config);

        host.add_volume_group("some_other_name", "/dev/loop7");
        assert_eq!(
            backend
                .ensure_volume_group(Path::new("/dev/loop7"))
                .unwrap(),
            "some_other_name"
        );
        assert!(host.calls_to(Dependency::Vgcreate).is_empty());
    }

    #[test]
    fn test_vg_index_skips_taken_names() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());
        let config = test_config(dir.path(), &host);
        let backend = ChrootBackend::new(&host, &config);

        let chroot = config.paths().chroot;
        host.add_volume_group(&vg_name(&chroot, 0), "/dev/loop3");
        assert_eq!(
            backend
                .ensure_volume_group(Path::new("/dev/loop0"))
                .unwrap(),
            vg_name(&chroot, 1)
        );
    }

    #[test]
    fn test_vg_activation_retries() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());
        let config = test_config(dir.path(), &host);
        let backend = ChrootBackend::new(&host, &config);
        host.add_volume_group("vg", "/dev/loop0");

        host.fail_times(2, |command| command.dependency() == Dependency::Vgchange);
        backend
            .ensure_volume_group(Path::new("/dev/loop0"))
            .unwrap();
        assert_eq!(host.calls_to(Dependency::Vgchange).len(), 3);

        host.clear_calls();
        host.fail_times(3, |command| command.dependency() == Dependency::Vgchange);
        backend
            .ensure_volume_group(Path::new("/dev/loop0"))
            .unwrap_err();
        assert_eq!(host.calls_to(Dependency::Vgchange).len(), 3);
    }

    #[test]
    fn test_missing_device_node() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());
        let config = test_config(dir.path(), &host);
        let backend = ChrootBackend::new(&host, &config);

        let error = backend.mount("cros_missing_000").unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::Storage(StorageError::DeviceNodeMissing { .. })
        ));
        assert!(host.calls_to(Dependency::Mount).is_empty());
    }

    #[test]
    fn test_format_waits_for_device_node() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());
        let config = test_config(dir.path(), &host);
        let backend = ChrootBackend::new(&host, &config);
        // An inactive group gets no device nodes for new volumes
        host.add_volume_group("cros_idle_000", "/dev/loop0");

        let error = backend.ensure_thin_pool_and_lv("cros_idle_000").unwrap_err();
        assert_eq!(
            error.kind(),
            &ErrorKind::Storage(StorageError::DeviceNodeMissing {
                device: host
                    .dev_dir()
                    .join("cros_idle_000/chroot")
                    .display()
                    .to_string(),
            })
        );
        assert!(host.calls_to(Dependency::Mke2fs).is_empty());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());
        let config = test_config(dir.path(), &host);
        let paths = config.paths();
        let backend = ChrootBackend::new(&host, &config);

        backend.mount_chroot(true).unwrap();
        let vg = vg_name(&paths.chroot, 0);

        backend.cleanup(true).unwrap();
        assert!(host.mount_targets().is_empty());
        assert!(host.loop_devices().is_empty());
        assert!(!host.volume(&vg, "chroot").unwrap().active);
        assert!(!paths.image.exists());
        assert!(!paths.chroot.exists());

        host.clear_calls();
        backend.cleanup(true).unwrap();
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_cleanup_reports_busy_mount() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());
        let config = test_config(dir.path(), &host);
        let backend = ChrootBackend::new(&host, &config);

        backend.mount_chroot(true).unwrap();
        host.fail_when(|command| command.dependency() == Dependency::Umount);
        let error = backend.cleanup(true).unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::Contention(ContentionError::MountBusy { .. })
        ));
        assert_eq!(host.calls_to(Dependency::Fuser).len(), 1);
        // Nothing past the unmount was touched
        assert!(config.paths().image.exists());
        assert_eq!(host.loop_devices().len(), 1);
    }

    #[test]
    fn test_trim() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());
        let config = test_config(dir.path(), &host);
        let backend = ChrootBackend::new(&host, &config);

        assert!(matches!(
            backend.trim().unwrap_err().kind(),
            ErrorKind::Storage(StorageError::NotMounted { .. })
        ));
        backend.mount_chroot(true).unwrap();
        assert!(backend.trim().unwrap().contains("trimmed"));
    }
}
