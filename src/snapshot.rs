use std::path::Path;

use log::{debug, info, warn};
use uuid::Uuid;

use osutils::{dependencies::CommandRunner, lvm::VolumeManager};
use sdk_api::{
    constants::{CHROOT_LV_NAME, CHROOT_THINPOOL_NAME},
    error::{SdkError, StorageError},
};

/// Names that belong to the live chroot and are never treated as snapshots.
const RESERVED_NAMES: &[&str] = &[CHROOT_LV_NAME, CHROOT_THINPOOL_NAME];

fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Thin snapshots of the `chroot` volume inside one volume group.
pub struct SnapshotManager<'a> {
    volumes: VolumeManager<'a>,
    vg: String,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner, vg: impl Into<String>, dev_dir: &Path) -> Self {
        Self {
            volumes: VolumeManager::with_dev_dir(runner, dev_dir),
            vg: vg.into(),
        }
    }

    pub fn create(&self, name: &str) -> Result<(), SdkError> {
        if self.volumes.lv_exists(&self.vg, name)? {
            return Err(SdkError::new(StorageError::SnapshotExists { name: name.into() }));
        }
        self.volumes.create_snapshot(&self.vg, CHROOT_LV_NAME, name)?;
        info!("Created snapshot '{name}'");
        Ok(())
    }

    /// Snapshot names, sorted.
    ///
    /// LVM does not remember the origin of a thin snapshot once it has been renamed, so any thin
    /// volume in the pool other than the live chroot counts.
    pub fn list(&self) -> Result<Vec<String>, SdkError> {
        let mut names = self
            .volumes
            .logical_volumes(&self.vg)?
            .into_iter()
            .filter(|lv| lv.pool == CHROOT_THINPOOL_NAME && lv.is_thin_volume())
            .map(|lv| lv.name)
            .filter(|name| !is_reserved(name))
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }

    pub fn delete(&self, name: &str) -> Result<(), SdkError> {
        if is_reserved(name) {
            warn!("Refusing to delete reserved volume '{name}'");
            return Ok(());
        }
        if !self.volumes.lv_exists(&self.vg, name)? {
            debug!("Snapshot '{name}' does not exist, nothing to delete");
            return Ok(());
        }
        self.volumes.remove_lv(&self.vg, name)?;
        info!("Deleted snapshot '{name}'");
        Ok(())
    }

    /// Replaces the live chroot volume with snapshot `name`, consuming the snapshot. The chroot
    /// must not be mounted. Returns false when there is no such snapshot.
    pub fn restore(&self, name: &str) -> Result<bool, SdkError> {
        if is_reserved(name) {
            warn!("'{name}' is not a snapshot");
            return Ok(false);
        }
        if !self.list()?.iter().any(|snapshot| snapshot == name) {
            warn!("Snapshot '{name}' does not exist");
            return Ok(false);
        }

        let backup = format!("{CHROOT_LV_NAME}_bak_{}", Uuid::new_v4().simple());
        self.volumes
            .rename_lv(&self.vg, CHROOT_LV_NAME, &backup)
            .map_err(|e| restore_error(name, e))?;

        if let Err(e) = self.volumes.rename_lv(&self.vg, name, CHROOT_LV_NAME) {
            return Err(match self.volumes.rename_lv(&self.vg, &backup, CHROOT_LV_NAME) {
                Ok(()) => restore_error(name, e),
                Err(rollback) => {
                    restore_error(name, e).secondary_error_context(rollback)
                }
            });
        }

        // Thin snapshots skip activation by default.
        if let Err(e) = self.volumes.clear_activation_skip(&self.vg, CHROOT_LV_NAME) {
            warn!("Failed to clear the activation skip flag: {e:?}");
        }
        self.volumes.activate_lv(&self.vg, CHROOT_LV_NAME)?;
        self.volumes.remove_lv(&self.vg, &backup)?;

        info!("Restored snapshot '{name}'");
        Ok(true)
    }
}

fn restore_error(name: &str, source: SdkError) -> SdkError {
    SdkError::with_source(
        StorageError::SnapshotRestore { name: name.into() },
        source.unstructured("Failed to rename logical volume"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use osutils::{dependencies::Dependency, testutils::fake_host::FakeHost};
    use sdk_api::error::ErrorKind;

    const VG: &str = "cros_test_000";

    fn setup() -> (tempfile::TempDir, FakeHost) {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());
        host.add_volume_group(VG, "/dev/loop0");
        VolumeManager::new(&host)
            .create_thin_pool_and_lv(VG, CHROOT_THINPOOL_NAME, "1G", CHROOT_LV_NAME, "2G")
            .unwrap();
        host.set_content(VG, CHROOT_LV_NAME, "v1");
        (dir, host)
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (dir, host) = setup();
        let snapshots = SnapshotManager::new(&host, VG, &dir.path().join("dev"));

        snapshots.create("before-upgrade").unwrap();
        host.set_content(VG, CHROOT_LV_NAME, "v2");
        assert_eq!(snapshots.list().unwrap(), vec!["before-upgrade"]);

        assert!(snapshots.restore("before-upgrade").unwrap());
        let live = host.volume(VG, CHROOT_LV_NAME).unwrap();
        assert_eq!(live.content, "v1");
        assert!(live.active);
        assert!(!live.skip_activation);
        assert_eq!(host.lv_names(VG), vec!["chroot", "thinpool"]);
        assert!(snapshots.list().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_collision() {
        let (dir, host) = setup();
        let snapshots = SnapshotManager::new(&host, VG, &dir.path().join("dev"));

        snapshots.create("snap").unwrap();
        let error = snapshots.create("snap").unwrap_err();
        assert_eq!(
            error.kind(),
            &ErrorKind::Storage(StorageError::SnapshotExists {
                name: "snap".into()
            })
        );
        assert!(matches!(
            snapshots.create(CHROOT_THINPOOL_NAME).unwrap_err().kind(),
            ErrorKind::Storage(StorageError::SnapshotExists { .. })
        ));
        assert_eq!(snapshots.list().unwrap(), vec!["snap"]);
    }

    #[test]
    fn test_reserved_names() {
        let (dir, host) = setup();
        let snapshots = SnapshotManager::new(&host, VG, &dir.path().join("dev"));
        host.clear_calls();

        snapshots.delete(CHROOT_LV_NAME).unwrap();
        snapshots.delete(CHROOT_THINPOOL_NAME).unwrap();
        assert!(!snapshots.restore(CHROOT_LV_NAME).unwrap());
        assert!(!snapshots.restore(CHROOT_THINPOOL_NAME).unwrap());
        assert!(host.calls_to(Dependency::Lvremove).is_empty());
        assert!(host.calls_to(Dependency::Lvrename).is_empty());
        assert_eq!(host.lv_names(VG), vec!["chroot", "thinpool"]);
    }

    #[test]
    fn test_delete_and_unknown() {
        let (dir, host) = setup();
        let snapshots = SnapshotManager::new(&host, VG, &dir.path().join("dev"));

        snapshots.create("a").unwrap();
        snapshots.create("b").unwrap();
        assert_eq!(snapshots.list().unwrap(), vec!["a", "b"]);
        snapshots.delete("a").unwrap();
        snapshots.delete("a").unwrap();
        assert_eq!(snapshots.list().unwrap(), vec!["b"]);
        assert!(!snapshots.restore("missing").unwrap());
    }

    #[test]
    fn test_restore_rollback() {
        let (dir, host) = setup();
        let snapshots = SnapshotManager::new(&host, VG, &dir.path().join("dev"));
        snapshots.create("snap").unwrap();
        host.set_content(VG, CHROOT_LV_NAME, "v2");

        host.fail_when(|command| {
            command.dependency() == Dependency::Lvrename
                && command.arg_strings().get(2).map(String::as_str) == Some("snap")
        });
        let error = snapshots.restore("snap").unwrap_err();
        assert_eq!(
            error.kind(),
            &ErrorKind::Storage(StorageError::SnapshotRestore {
                name: "snap".into()
            })
        );

        // The live volume is back under its own name, untouched.
        assert_eq!(host.volume(VG, CHROOT_LV_NAME).unwrap().content, "v2");
        assert_eq!(host.lv_names(VG), vec!["chroot", "snap", "thinpool"]);
    }

    #[test]
    fn test_restore_first_rename_fails() {
        let (dir, host) = setup();
        let snapshots = SnapshotManager::new(&host, VG, &dir.path().join("dev"));
        snapshots.create("snap").unwrap();

        host.fail_times(1, |command| command.dependency() == Dependency::Lvrename);
        snapshots.restore("snap").unwrap_err();
        assert_eq!(host.calls_to(Dependency::Lvrename).len(), 1);
        assert_eq!(host.lv_names(VG), vec!["chroot", "snap", "thinpool"]);
    }
}
