use const_format::formatcp;

// Chroot layout constants. Paths are relative to the chroot root.

/// File holding the chroot's on-disk schema version.
pub const CHROOT_VERSION_FILE: &str = "etc/cros_chroot_version";

/// Marker left for legacy consumers that sniff for a cros SDK chroot.
pub const CHROOT_MARKER_FILE: &str = "etc/debian_chroot";

/// Where the source checkout is bind mounted inside the chroot.
pub const CHROOT_SOURCE_MOUNT: &str = "mnt/host/source";

/// Absolute form of `CHROOT_SOURCE_MOUNT`, as seen from inside the chroot.
pub const CHROOT_SOURCE_ROOT: &str = formatcp!("/{}", CHROOT_SOURCE_MOUNT);

/// Absolute path of depot_tools as seen from inside the chroot.
pub const CHROOT_DEPOT_TOOLS_ROOT: &str = "/mnt/host/depot_tools";

/// Upgrade hook directory, relative to the source checkout.
pub const CHROOT_VERSION_HOOKS_DIR: &str = "chromite/sdk/chroot_version_hooks.d";

/// Bootstrap script, relative to the source checkout.
pub const MAKE_CHROOT_SCRIPT: &str = "src/scripts/sdk_lib/make_chroot.sh";

// LVM naming constants

/// Name of the logical volume holding the chroot filesystem.
pub const CHROOT_LV_NAME: &str = "chroot";

/// Name of the thin pool backing the chroot LV and its snapshots.
pub const CHROOT_THINPOOL_NAME: &str = "thinpool";

/// Prefix of every chroot volume group.
pub const CHROOT_VG_PREFIX: &str = "cros";

/// Number of trailing chroot path characters folded into the VG name.
pub const CHROOT_VG_PATH_SUFFIX_LEN: usize = 90;

/// Virtual size of the sparse backing image.
pub const DEFAULT_IMAGE_SIZE_BYTES: u64 = 500 * GIB;

/// Size of the thin pool, kept below the image size for LVM metadata.
pub const THINPOOL_SIZE: &str = "499G";

/// Virtual size of the chroot LV.
pub const CHROOT_LV_SIZE: &str = "500G";

/// Extension of the backing image next to the chroot directory.
pub const CHROOT_IMAGE_EXTENSION: &str = "img";

const GIB: u64 = 1024 * 1024 * 1024;

// Host paths

/// Kernel mount table.
pub const PROC_MOUNTS_PATH: &str = "/proc/mounts";

/// Filesystems supported by the running kernel.
pub const PROC_FILESYSTEMS_PATH: &str = "/proc/filesystems";

/// Optional YAML configuration file.
pub const SDK_CONFIG_PATH: &str = "/etc/cros_sdk/config.yaml";

/// Supplemental groups every mirrored user joins inside the chroot.
pub const DEFAULT_SUPPLEMENTAL_GROUPS: &[&str] =
    &["adm", "cdrom", "floppy", "disk", "audio", "video", "portage"];
