use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use log::{debug, info};
use nix::unistd::{chown, Gid, Uid};

use osutils::{
    dependencies::{CommandRunner, Dependency},
    files,
};
use sdk_api::error::{ReportError, SdkError, SdkResultExt, SetupError, VersionError};

use crate::config::ChrootPaths;

/// Tracks the on-disk schema version of a chroot and applies upgrade hooks to it.
///
/// Hooks live in a flat directory as `<version>_<description>` and are run inside the chroot in
/// ascending order. Each hook moves the chroot from `version - 1` to `version`.
pub struct ChrootUpdater<'a> {
    runner: &'a dyn CommandRunner,
    chroot: PathBuf,
    version_file: PathBuf,
    hooks_dir: PathBuf,
    owner: Option<(u32, u32)>,
}

impl<'a> ChrootUpdater<'a> {
    pub fn new(runner: &'a dyn CommandRunner, paths: &ChrootPaths) -> Self {
        Self {
            runner,
            chroot: paths.chroot.clone(),
            version_file: paths.version_file.clone(),
            hooks_dir: paths.hooks_dir.clone(),
            owner: Some((0, 0)),
        }
    }

    /// Owner the version file is handed to after every write. `None` leaves it as created.
    pub fn with_owner(self, owner: Option<(u32, u32)>) -> Self {
        Self { owner, ..self }
    }

    pub fn get_version(&self) -> Result<u32, SdkError> {
        if !self.version_file.exists() {
            return Err(SdkError::new(VersionError::Uninitialized {
                path: self.chroot.display().to_string(),
            }));
        }

        let content = files::read_file_trim(&self.version_file).structured(
            VersionError::Uninitialized {
                path: self.chroot.display().to_string(),
            },
        )?;
        content
            .parse::<u32>()
            .structured(VersionError::InvalidVersion {
                path: self.version_file.display().to_string(),
                content,
            })
    }

    pub fn set_version(&self, version: u32) -> Result<(), SdkError> {
        let write_error = || VersionError::WriteVersion {
            path: self.version_file.display().to_string(),
        };
        files::write_file(&self.version_file, 0o644, format!("{version}\n").as_bytes())
            .structured(write_error())?;
        if let Some((uid, gid)) = self.owner {
            chown(
                &self.version_file,
                Some(Uid::from_raw(uid)),
                Some(Gid::from_raw(gid)),
            )
            .structured(write_error())
            .message(format!("Failed to hand the version file to {uid}:{gid}"))?;
        }
        debug!("Chroot version set to {version}");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.get_version().map(|v| v > 0).unwrap_or(false)
    }

    /// Upgrade hooks keyed by the version they produce.
    pub fn hooks(&self) -> Result<BTreeMap<u32, PathBuf>, SdkError> {
        let read_error = || VersionError::ReadHooks {
            path: self.hooks_dir.display().to_string(),
        };
        let mut hooks = BTreeMap::<u32, PathBuf>::new();
        for entry in std::fs::read_dir(&self.hooks_dir).structured(read_error())? {
            let entry = entry.structured(read_error())?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }

            let version = hook_version(&name)?;
            if let Some(previous) = hooks.insert(version, entry.path()) {
                let mut names = [file_name(&previous), name];
                names.sort();
                let [first, second] = names;
                return Err(SdkError::new(VersionError::DuplicateHook {
                    version,
                    first,
                    second,
                }));
            }
        }
        Ok(hooks)
    }

    pub fn latest_version(&self) -> Result<u32, SdkError> {
        Ok(self.hooks()?.keys().next_back().copied().unwrap_or(0))
    }

    pub fn earliest_version(&self) -> Result<u32, SdkError> {
        Ok(self.hooks()?.keys().next().copied().unwrap_or(0))
    }

    /// Hooks that `apply_updates` would run, in order.
    pub fn pending_updates(&self) -> Result<Vec<(u32, PathBuf)>, SdkError> {
        let current = self.get_version()?;
        let mut hooks = self.hooks()?;
        let latest = hooks.keys().next_back().copied().unwrap_or(0);
        check_not_too_new(current, latest)?;

        (current + 1..=latest)
            .map(|version| {
                hooks
                    .remove(&version)
                    .map(|hook| (version, hook))
                    .structured(VersionError::Deprecated {
                        version: current,
                        missing: version,
                    })
            })
            .collect()
    }

    /// Brings the chroot up to the latest hook version, persisting progress after every hook.
    ///
    /// A failing hook leaves the version at the last hook that succeeded, so running this again
    /// retries the failed hook.
    /// Every hook is located before the first one runs, so a gap in the sequence fails without
    /// touching the chroot.
    pub fn apply_updates(&self) -> Result<(), SdkError> {
        let current = self.get_version()?;
        let pending = self.pending_updates()?;
        let Some((latest, _)) = pending.last() else {
            debug!("Chroot is up to date at version {current}");
            return Ok(());
        };

        info!("Upgrading chroot from version {current} to {latest}");
        for (version, hook) in &pending {
            let version = *version;
            self.run_hook(hook)?;
            self.set_version(version)
                .message(format!("Failed to record chroot version {version}"))?;
        }
        Ok(())
    }

    /// Copies the hook into the chroot's `/tmp` and runs it there with bash.
    fn run_hook(&self, hook: &Path) -> Result<(), SdkError> {
        let name = file_name(hook);
        info!("Running chroot upgrade hook '{name}'");

        let staged = self.chroot.join("tmp").join(&name);
        files::create_dirs(self.chroot.join("tmp"))
            .and_then(|()| {
                std::fs::copy(hook, &staged)
                    .map(|_| ())
                    .map_err(anyhow::Error::from)
            })
            .structured(SetupError::Populate {
                step: "stage upgrade hook",
            })
            .message(format!("Failed to copy '{}' into the chroot", hook.display()))?;

        let result = Dependency::Chroot
            .cmd()
            .with_arg(&self.chroot)
            .with_args(["/bin/bash".to_string(), format!("/tmp/{name}")])
            .run_and_check(self.runner);

        if let Err(e) = std::fs::remove_file(&staged) {
            debug!("Failed to remove staged hook '{}': {e}", staged.display());
        }

        result.structured(VersionError::HookFailed { hook: name })
    }
}

fn check_not_too_new(current: u32, latest: u32) -> Result<(), SdkError> {
    if current > latest {
        return Err(SdkError::new(VersionError::TooNew {
            version: current,
            latest,
        }));
    }
    Ok(())
}

/// Parses the version out of `<version>_<description>`.
fn hook_version(name: &str) -> Result<u32, SdkError> {
    name.split_once('_')
        .map_or(name, |(version, _)| version)
        .parse::<u32>()
        .structured(VersionError::InvalidHookName { name: name.into() })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned()
}
