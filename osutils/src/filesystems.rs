use std::path::Path;

use anyhow::{Context, Error};

/// File system types for `mount`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountFileSystemType {
    Ext4,
    Proc,
    Sysfs,
    BinfmtMisc,
    Configfs,
}

impl MountFileSystemType {
    pub fn name(self) -> &'static str {
        match self {
            MountFileSystemType::Ext4 => "ext4",
            MountFileSystemType::Proc => "proc",
            MountFileSystemType::Sysfs => "sysfs",
            MountFileSystemType::BinfmtMisc => "binfmt_misc",
            MountFileSystemType::Configfs => "configfs",
        }
    }

    /// Whether the running kernel lists this type in a `/proc/filesystems`-formatted file.
    pub fn is_supported(self, proc_filesystems: impl AsRef<Path>) -> Result<bool, Error> {
        let content = std::fs::read_to_string(proc_filesystems.as_ref()).context(format!(
            "Failed to read supported filesystems from '{}'",
            proc_filesystems.as_ref().display()
        ))?;
        let supported = supported_filesystems(&content).any(|name| name == self.name());
        Ok(supported)
    }
}

impl std::fmt::Display for MountFileSystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Lines look like `nodev\tsysfs` or `\text4`; the name is always the last column.
fn supported_filesystems(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().last())
}
