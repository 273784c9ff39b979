//! Host checks run before any chroot operation.

use std::path::Path;

use log::debug;
use nix::unistd::{Gid, Group, Uid, User};

use osutils::dependencies::Dependency;
use sdk_api::{
    constants::CHROOT_VERSION_FILE,
    error::{EnvironmentError, ReportError, SdkError, SdkResultExt},
};

use crate::config::SdkConfig;

/// The host account that invoked the tool through sudo, mirrored inside the chroot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostUser {
    pub name: String,
    pub uid: u32,
    pub group: String,
    pub gid: u32,
}

impl HostUser {
    /// Resolves the invoking user from the environment sudo sets up, falling back to the current
    /// real user.
    pub fn from_env(var: impl Fn(&str) -> Option<String>) -> Result<Self, SdkError> {
        let parse_id = |name: &str| {
            var(name)
                .map(|value| value.parse::<u32>())
                .transpose()
                .structured(EnvironmentError::InvokingUser)
                .message(format!("${name} is not a number"))
        };

        let uid = parse_id("SUDO_UID")?.unwrap_or_else(|| Uid::current().as_raw());
        let gid = parse_id("SUDO_GID")?.unwrap_or_else(|| Gid::current().as_raw());
        let name = match var("SUDO_USER") {
            Some(name) => name,
            None => User::from_uid(Uid::from_raw(uid))
                .structured(EnvironmentError::InvokingUser)?
                .structured(EnvironmentError::InvokingUser)
                .message(format!("No account with uid {uid}"))?
                .name,
        };
        let group = Group::from_gid(Gid::from_raw(gid))
            .structured(EnvironmentError::InvokingUser)?
            .map(|group| group.name)
            .unwrap_or_else(|| name.clone());

        Ok(Self {
            name,
            uid,
            group,
            gid,
        })
    }
}

pub fn check_root() -> Result<(), SdkError> {
    if Uid::effective().is_root() {
        Ok(())
    } else {
        Err(SdkError::new(EnvironmentError::MissingRootPrivileges))
    }
}

pub fn check_architecture(arch: &str) -> Result<(), SdkError> {
    if arch == "x86_64" {
        return Ok(());
    }
    Err(SdkError::new(EnvironmentError::UnsupportedArchitecture {
        arch: arch.into(),
    }))
}

/// Fails when `etc_dir` belongs to a chroot, which is recognizable by its version file.
pub fn check_not_inside_chroot(etc_dir: &Path) -> Result<(), SdkError> {
    let marker = Path::new(CHROOT_VERSION_FILE)
        .file_name()
        .map(|name| etc_dir.join(name));
    match marker {
        Some(marker) if marker.exists() => Err(SdkError::new(EnvironmentError::InsideChroot)),
        _ => Ok(()),
    }
}

/// Fails on the first dependency `exists` rejects.
pub fn check_dependencies(
    dependencies: &[Dependency],
    exists: impl Fn(Dependency) -> bool,
) -> Result<(), SdkError> {
    match dependencies.iter().find(|dependency| !exists(**dependency)) {
        Some(missing) => Err(SdkError::new(EnvironmentError::MissingBinary {
            binary: missing.name(),
        })),
        None => Ok(()),
    }
}

/// Runs every host check.
pub fn preflight(config: &SdkConfig) -> Result<(), SdkError> {
    check_root()?;
    check_architecture(std::env::consts::ARCH)?;
    check_not_inside_chroot(&config.host.etc_dir)?;
    check_dependencies(Dependency::REQUIRED, |dependency| dependency.exists())?;
    debug!("Host checks passed");
    Ok(())
}
