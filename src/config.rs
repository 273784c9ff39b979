use std::{
    ffi::OsString,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use log::debug;
use serde::{Deserialize, Serialize};

use sdk_api::{
    constants::{
        CHROOT_IMAGE_EXTENSION, CHROOT_VERSION_FILE, CHROOT_VERSION_HOOKS_DIR,
        DEFAULT_IMAGE_SIZE_BYTES, PROC_FILESYSTEMS_PATH, PROC_MOUNTS_PATH, SDK_CONFIG_PATH,
    },
    error::{EnvironmentError, ReportError, SdkError},
};

/// Settings for one invocation. Every path the tool touches is derived from this value, so that
/// several chroots (or fake hosts in tests) can be handled in the same process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SdkConfig {
    /// Root of the source checkout, bind mounted into the chroot.
    pub source_root: PathBuf,

    /// Chroot directory. Defaults to `<sourceRoot>/chroot`.
    pub chroot: Option<PathBuf>,

    /// Package and tarball cache. Defaults to `<sourceRoot>/.cache`.
    pub cache_dir: Option<PathBuf>,

    /// depot_tools checkout, bind mounted at `/mnt/host/depot_tools` inside the chroot.
    pub depot_tools: Option<PathBuf>,

    /// SDK tarball used by `create`.
    pub sdk_tarball: Option<PathBuf>,

    /// Virtual size of the sparse backing image.
    pub image_size_bytes: u64,

    /// How long to wait for the chroot lock.
    pub lock_timeout_secs: u64,

    pub host: HostPaths,

    pub retry: RetryPolicy,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("."),
            chroot: None,
            cache_dir: None,
            depot_tools: None,
            sdk_tarball: None,
            image_size_bytes: DEFAULT_IMAGE_SIZE_BYTES,
            lock_timeout_secs: 300,
            host: HostPaths::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Host locations that are read rather than modified.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct HostPaths {
    pub mount_table: PathBuf,
    pub proc_filesystems: PathBuf,
    pub dev_dir: PathBuf,
    /// Host `/etc`, source of timezone, resolver and hosts files.
    pub etc_dir: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            mount_table: PROC_MOUNTS_PATH.into(),
            proc_filesystems: PROC_FILESYSTEMS_PATH.into(),
            dev_dir: "/dev".into(),
            etc_dir: "/etc".into(),
        }
    }
}

/// Bounded retries around LVM activation latency.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RetryPolicy {
    pub vg_activation_attempts: u32,
    pub device_wait_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            vg_activation_attempts: 3,
            device_wait_attempts: 5,
            delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl SdkConfig {
    /// Loads the configuration from `path`, or from the system-wide file when it exists, or
    /// falls back to defaults. An explicitly requested file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, SdkError> {
        let path = match path {
            Some(path) => path.to_owned(),
            None if Path::new(SDK_CONFIG_PATH).exists() => PathBuf::from(SDK_CONFIG_PATH),
            None => return Ok(Self::default()),
        };

        debug!("Loading configuration from '{}'", path.display());
        let load_error = || EnvironmentError::LoadConfig {
            path: path.display().to_string(),
        };
        let contents = std::fs::read_to_string(&path).structured(load_error())?;
        serde_yaml::from_str(&contents).structured(load_error())
    }

    /// Resolves every path of the chroot. Relative settings are anchored at the current
    /// directory, since mount targets and `/proc/mounts` entries are always absolute.
    pub fn paths(&self) -> ChrootPaths {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        self.paths_from(&cwd)
    }

    fn paths_from(&self, cwd: &Path) -> ChrootPaths {
        let source_root = absolute(&self.source_root, cwd);
        let chroot = match &self.chroot {
            Some(chroot) => absolute(chroot, cwd),
            None => source_root.join("chroot"),
        };
        let cache_dir = match &self.cache_dir {
            Some(cache_dir) => absolute(cache_dir, cwd),
            None => source_root.join(".cache"),
        };

        let mut image = OsString::from(chroot.as_os_str());
        image.push(".");
        image.push(CHROOT_IMAGE_EXTENSION);

        let mut lock_name = OsString::from(".");
        lock_name.push(chroot.file_name().unwrap_or(chroot.as_os_str()));
        lock_name.push("_lock");
        let lock = chroot
            .parent()
            .unwrap_or(Path::new("/"))
            .join(lock_name);

        ChrootPaths {
            version_file: chroot.join(CHROOT_VERSION_FILE),
            hooks_dir: source_root.join(CHROOT_VERSION_HOOKS_DIR),
            image: PathBuf::from(image),
            lock,
            cache_dir,
            depot_tools: self.depot_tools.as_deref().map(|path| absolute(path, cwd)),
            source_root,
            chroot,
        }
    }
}

/// Joins `path` onto `cwd` when relative and drops `.` and `..` components lexically.
fn absolute(path: &Path, cwd: &Path) -> PathBuf {
    let mut resolved = if path.is_absolute() {
        PathBuf::new()
    } else {
        cwd.to_path_buf()
    };
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other),
        }
    }
    resolved
}

/// Every path belonging to one chroot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChrootPaths {
    pub chroot: PathBuf,
    /// Sparse backing image, `<chroot>.img`.
    pub image: PathBuf,
    /// Advisory lock file, `<parent>/.<name>_lock`.
    pub lock: PathBuf,
    pub version_file: PathBuf,
    pub hooks_dir: PathBuf,
    pub source_root: PathBuf,
    pub cache_dir: PathBuf,
    pub depot_tools: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    use sdk_api::error::ErrorKind;

    #[test]
    fn test_paths() {
        let config = SdkConfig {
            source_root: "/home/user/chromiumos".into(),
            ..Default::default()
        };
        let paths = config.paths();
        assert_eq!(paths.chroot, PathBuf::from("/home/user/chromiumos/chroot"));
        assert_eq!(paths.image, PathBuf::from("/home/user/chromiumos/chroot.img"));
        assert_eq!(paths.lock, PathBuf::from("/home/user/chromiumos/.chroot_lock"));
        assert_eq!(
            paths.version_file,
            PathBuf::from("/home/user/chromiumos/chroot/etc/cros_chroot_version")
        );
        assert_eq!(
            paths.hooks_dir,
            PathBuf::from("/home/user/chromiumos/chromite/sdk/chroot_version_hooks.d")
        );
        assert_eq!(paths.cache_dir, PathBuf::from("/home/user/chromiumos/.cache"));

        let config = SdkConfig {
            chroot: Some("/work/sdk".into()),
            cache_dir: Some("/var/cache/sdk".into()),
            ..config
        };
        let paths = config.paths();
        assert_eq!(paths.image, PathBuf::from("/work/sdk.img"));
        assert_eq!(paths.lock, PathBuf::from("/work/.sdk_lock"));
        assert_eq!(paths.cache_dir, PathBuf::from("/var/cache/sdk"));
    }

    #[test]
    fn test_relative_paths() {
        let config = SdkConfig {
            chroot: Some("./out/../sdk".into()),
            depot_tools: Some("depot_tools".into()),
            ..Default::default()
        };
        let paths = config.paths_from(Path::new("/home/user/chromiumos"));
        assert_eq!(paths.source_root, PathBuf::from("/home/user/chromiumos"));
        assert_eq!(paths.chroot, PathBuf::from("/home/user/chromiumos/sdk"));
        assert_eq!(paths.image, PathBuf::from("/home/user/chromiumos/sdk.img"));
        assert_eq!(paths.lock, PathBuf::from("/home/user/chromiumos/.sdk_lock"));
        assert_eq!(
            paths.depot_tools,
            Some(PathBuf::from("/home/user/chromiumos/depot_tools"))
        );
        assert_eq!(paths.cache_dir, PathBuf::from("/home/user/chromiumos/.cache"));

        let paths = SdkConfig::default().paths();
        assert!(paths.chroot.is_absolute());
        assert!(!paths
            .chroot
            .components()
            .any(|c| matches!(c, Component::CurDir | Component::ParentDir)));
    }

    #[test]
    fn test_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            indoc! {r#"
                sourceRoot: /src
                lockTimeoutSecs: 10
                retry:
                  delayMs: 0
                host:
                  mountTable: /tmp/mounts
            "#},
        )
        .unwrap();

        let config = SdkConfig::load(Some(&path)).unwrap();
        assert_eq!(config.source_root, PathBuf::from("/src"));
        assert_eq!(config.lock_timeout_secs, 10);
        assert_eq!(config.retry.delay(), Duration::ZERO);
        assert_eq!(config.retry.vg_activation_attempts, 3);
        assert_eq!(config.host.mount_table, PathBuf::from("/tmp/mounts"));
        assert_eq!(config.host.dev_dir, PathBuf::from("/dev"));
        assert_eq!(config.image_size_bytes, DEFAULT_IMAGE_SIZE_BYTES);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert_eq!(
            SdkConfig::load(Some(&missing)).unwrap_err().kind(),
            &ErrorKind::Environment(EnvironmentError::LoadConfig {
                path: missing.display().to_string()
            })
        );

        let unknown = dir.path().join("unknown.yaml");
        std::fs::write(&unknown, "sourceRoot: /src\nnoSuchField: 1\n").unwrap();
        assert!(SdkConfig::load(Some(&unknown)).is_err());
    }
}
