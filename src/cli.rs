use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use log::LevelFilter;

use crate::{config::SdkConfig, CROS_SDK_VERSION};

#[derive(Parser, Debug)]
#[clap(version = CROS_SDK_VERSION)]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Info)]
    pub verbosity: LevelFilter,

    /// YAML configuration file, defaults to /etc/cros_sdk/config.yaml when it exists
    #[arg(global = true, long)]
    pub config: Option<PathBuf>,

    /// Chroot directory
    #[arg(global = true, long)]
    pub chroot: Option<PathBuf>,

    /// Root of the source checkout
    #[arg(global = true, long)]
    pub source_root: Option<PathBuf>,

    /// Also append JSON log lines to this file
    #[arg(global = true, long)]
    pub log_file: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Applies the flags that override configuration values.
    pub fn apply_overrides(&self, config: &mut SdkConfig) {
        if let Some(source_root) = &self.source_root {
            config.source_root = source_root.clone();
        }
        if let Some(chroot) = &self.chroot {
            config.chroot = Some(chroot.clone());
        }
        if let Commands::Create {
            tarball: Some(tarball),
            ..
        } = &self.command
        {
            config.sdk_tarball = Some(tarball.clone());
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the chroot
    Create {
        /// Delete an existing chroot first
        #[clap(long)]
        replace: bool,

        /// Build every package from source instead of using prebuilts
        #[clap(long)]
        nousepkg: bool,

        /// SDK tarball to unpack
        #[clap(long)]
        tarball: Option<PathBuf>,
    },

    /// Enter the chroot, creating or upgrading it first when needed
    Enter {
        /// Build every package from source if the chroot has to be created
        #[clap(long)]
        nousepkg: bool,

        /// Command to run instead of a login shell
        #[clap(last = true)]
        command: Vec<String>,
    },

    /// Delete the chroot and its backing image
    Delete {
        /// Proceed without the chroot lock when it cannot be acquired
        #[clap(long)]
        force: bool,
    },

    /// Unmount the chroot and release its loopback device
    Unmount,

    /// Manage chroot snapshots
    Snapshot {
        #[clap(subcommand)]
        action: SnapshotAction,
    },

    /// Give blocks freed inside the chroot back to the host
    Fstrim,

    /// Print the chroot version and pending upgrade hooks
    Version,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotAction {
    /// Snapshot the current chroot
    Create { name: String },

    /// Replace the chroot with a snapshot, consuming it
    Restore { name: String },

    /// Delete a snapshot
    Delete { name: String },

    /// List snapshots
    List,
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Create { .. } => "create",
            Commands::Enter { .. } => "enter",
            Commands::Delete { .. } => "delete",
            Commands::Unmount => "unmount",
            Commands::Snapshot { action } => match action {
                SnapshotAction::Create { .. } => "snapshot create",
                SnapshotAction::Restore { .. } => "snapshot restore",
                SnapshotAction::Delete { .. } => "snapshot delete",
                SnapshotAction::List => "snapshot list",
            },
            Commands::Fstrim => "fstrim",
            Commands::Version => "version",
        }
    }
}

impl Display for Commands {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.name())
    }
}
