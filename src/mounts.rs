use std::path::{Path, PathBuf};

use log::{debug, warn};

use osutils::{
    dependencies::CommandRunner,
    filesystems::MountFileSystemType,
    mount::{self, MountManager},
    mountpoint,
};
use sdk_api::{
    constants::{CHROOT_DEPOT_TOOLS_ROOT, CHROOT_SOURCE_MOUNT},
    error::{ReportError, SdkError, SdkResultExt, SetupError},
};

use crate::config::{ChrootPaths, HostPaths};

const PSEUDO_FS_OPTIONS: &[&str] = &["nosuid", "nodev", "noexec", "relatime"];

/// Optional filesystems, mounted only when the host kernel supports them.
const OPTIONAL_MOUNTS: &[(MountFileSystemType, &str)] = &[
    (MountFileSystemType::BinfmtMisc, "proc/sys/fs/binfmt_misc"),
    (MountFileSystemType::Configfs, "sys/kernel/config"),
];

/// Sets up the auxiliary mounts a chroot needs to be usable.
///
/// Expects to run inside a private mount namespace; creating it is the caller's job.
pub struct ChrootMounter<'a> {
    runner: &'a dyn CommandRunner,
    source_root: PathBuf,
    depot_tools: Option<PathBuf>,
    proc_filesystems: PathBuf,
}

impl<'a> ChrootMounter<'a> {
    pub fn new(runner: &'a dyn CommandRunner, paths: &ChrootPaths, host: &HostPaths) -> Self {
        Self {
            runner,
            source_root: paths.source_root.clone(),
            depot_tools: paths.depot_tools.clone(),
            proc_filesystems: host.proc_filesystems.clone(),
        }
    }

    pub fn mount_chroot_paths(&self, chroot: &Path) -> Result<(), SdkError> {
        let mounts = MountManager::new(self.runner);

        // Unmounts on the host still reach us, our mounts do not leak back out.
        mounts.make_rslave("/")?;
        if mountpoint::check_is_mountpoint(self.runner, chroot)
            .structured(SetupError::Populate {
                step: "inspect chroot mount",
            })?
        {
            mounts.make_private(chroot)?;
        }

        // Everything else may end up nested below the source checkout, so it goes first.
        let source_mount = chroot.join(CHROOT_SOURCE_MOUNT);
        ensure_dir(&source_mount)?;
        mounts
            .bind(&self.source_root, &source_mount)
            .message("Failed to bind the source checkout into the chroot")?;

        if let Some(depot_tools) = &self.depot_tools {
            let target = chroot.join(CHROOT_DEPOT_TOOLS_ROOT.trim_start_matches('/'));
            ensure_dir(&target)?;
            mounts
                .bind(depot_tools, &target)
                .message("Failed to bind depot_tools into the chroot")?;
        }

        for (filesystem, dir) in [
            (MountFileSystemType::Proc, "proc"),
            (MountFileSystemType::Sysfs, "sys"),
        ] {
            let target = chroot.join(dir);
            ensure_dir(&target)?;
            mounts.mount(filesystem.name(), &target, filesystem, PSEUDO_FS_OPTIONS)?;
        }

        for (filesystem, dir) in OPTIONAL_MOUNTS {
            if !self.kernel_supports(*filesystem) {
                debug!("Kernel does not support {filesystem}, skipping");
                continue;
            }
            let target = chroot.join(dir);
            ensure_dir(&target)?;
            mounts.mount(filesystem.name(), &target, *filesystem, PSEUDO_FS_OPTIONS)?;
        }

        let dev = chroot.join("dev");
        ensure_dir(&dev)?;
        mounts
            .rbind("/dev", &dev)
            .message("Failed to expose host devices in the chroot")
    }

    fn kernel_supports(&self, filesystem: MountFileSystemType) -> bool {
        filesystem
            .is_supported(&self.proc_filesystems)
            .unwrap_or_else(|e| {
                warn!("Assuming {filesystem} is unsupported: {e:?}");
                false
            })
    }
}

fn ensure_dir(path: &Path) -> Result<(), SdkError> {
    mount::ensure_mount_directory(path)
        .structured(SetupError::Populate {
            step: "create mount points",
        })
        .message(format!("Failed to prepare mount point '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use osutils::{dependencies::Dependency, testutils::fake_host::FakeHost};

    use crate::config::SdkConfig;

    fn setup(filesystems: &str) -> (tempfile::TempDir, FakeHost, ChrootPaths, HostPaths) {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());
        let paths = SdkConfig {
            source_root: dir.path().join("src"),
            ..Default::default()
        }
        .paths();
        let host_paths = HostPaths {
            proc_filesystems: dir.path().join("filesystems"),
            mount_table: host.mounts_file().to_owned(),
            ..Default::default()
        };
        std::fs::write(&host_paths.proc_filesystems, filesystems).unwrap();
        std::fs::create_dir_all(&paths.chroot).unwrap();
        (dir, host, paths, host_paths)
    }

    #[test]
    fn test_mount_order() {
        let (_dir, host, paths, host_paths) =
            setup("nodev\tsysfs\nnodev\tproc\nnodev\tbinfmt_misc\nnodev\tconfigfs\n\text4\n");
        let chroot = &paths.chroot;
        ChrootMounter::new(&host, &paths, &host_paths)
            .mount_chroot_paths(chroot)
            .unwrap();

        let c = chroot.display();
        let s = paths.source_root.display();
        assert_eq!(
            host.calls(),
            vec![
                "mount --make-rslave /".to_string(),
                format!("mountpoint -q {c}"),
                format!("mount --bind {s} {c}/mnt/host/source"),
                format!("mount -t proc -o nosuid,nodev,noexec,relatime proc {c}/proc"),
                format!("mount -t sysfs -o nosuid,nodev,noexec,relatime sysfs {c}/sys"),
                format!(
                    "mount -t binfmt_misc -o nosuid,nodev,noexec,relatime binfmt_misc \
                    {c}/proc/sys/fs/binfmt_misc"
                ),
                format!(
                    "mount -t configfs -o nosuid,nodev,noexec,relatime configfs \
                    {c}/sys/kernel/config"
                ),
                format!("mount --rbind /dev {c}/dev"),
            ]
        );
        assert!(chroot.join("mnt/host/source").is_dir());
    }

    #[test]
    fn test_depot_tools_bind() {
        let (dir, host, paths, host_paths) = setup("nodev\tproc\n");
        let paths = ChrootPaths {
            depot_tools: Some(dir.path().join("depot_tools")),
            ..paths
        };
        ChrootMounter::new(&host, &paths, &host_paths)
            .mount_chroot_paths(&paths.chroot)
            .unwrap();

        let calls = host.calls();
        assert_eq!(
            calls[3],
            format!(
                "mount --bind {} {}/mnt/host/depot_tools",
                dir.path().join("depot_tools").display(),
                paths.chroot.display()
            )
        );
        assert!(paths.chroot.join("mnt/host/depot_tools").is_dir());
    }

    #[test]
    fn test_private_when_already_mounted() {
        let (_dir, host, paths, host_paths) = setup("nodev\tproc\n");
        host.add_mount("/dev/mapper/vg-chroot", &paths.chroot, "ext4");
        ChrootMounter::new(&host, &paths, &host_paths)
            .mount_chroot_paths(&paths.chroot)
            .unwrap();

        let calls = host.calls();
        assert_eq!(
            calls[2],
            format!("mount --make-private {}", paths.chroot.display())
        );
        // Unsupported optional filesystems are skipped without error
        assert!(!calls.iter().any(|call| call.contains("binfmt_misc")));
        assert!(!calls.iter().any(|call| call.contains("configfs")));
    }

    #[test]
    fn test_mount_failure_is_fatal() {
        let (_dir, host, paths, host_paths) = setup("");
        host.fail_when(|command| {
            command.dependency() == Dependency::Mount
                && command.arg_strings().contains(&"sysfs".to_string())
        });
        assert!(ChrootMounter::new(&host, &paths, &host_paths)
            .mount_chroot_paths(&paths.chroot)
            .is_err());
        // Nothing after the failed step was attempted
        assert!(!host.calls().iter().any(|call| call.contains("--rbind")));
    }
}
