//! First-time setup of a chroot from an SDK tarball.

use std::{
    os::unix::fs::{lchown, symlink, PermissionsExt},
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use indoc::formatdoc;
use log::{debug, info, warn};

use osutils::{
    dependencies::{CommandRunner, Dependency, DependencyResultExt},
    files,
};
use sdk_api::{
    constants::{
        CHROOT_DEPOT_TOOLS_ROOT, CHROOT_MARKER_FILE, CHROOT_SOURCE_ROOT,
        DEFAULT_SUPPLEMENTAL_GROUPS, MAKE_CHROOT_SCRIPT,
    },
    error::{ReportError, SdkError, SdkResultExt, SetupError},
};

use crate::{
    config::{ChrootPaths, HostPaths, SdkConfig},
    mounts::ChrootMounter,
    version::ChrootUpdater,
};

/// Directories every chroot has, whether or not the tarball ships them.
const BASELINE_DIRS: &[&str] = &[
    "mnt/host/source",
    "mnt/host/depot_tools",
    "mnt/host/out",
    "run",
    "var/cache/distfiles",
    "var/log",
    "etc/env.d",
];

/// Locales generated inside the chroot.
const LOCALES: &[&str] = &["en_US ISO-8859-1", "en_US.UTF-8 UTF-8"];

const PROFILE_LINES: &[&str] = &[
    "[ -f ~/.bashrc ] && . ~/.bashrc",
    "cd /mnt/host/source/src/scripts",
];

/// Populates a new chroot and hands it to the bootstrap script.
///
/// Nothing is rolled back on failure, a half-built chroot is removed with `cros_sdk delete`.
pub struct ChrootCreator<'a> {
    runner: &'a dyn CommandRunner,
    paths: ChrootPaths,
    host: HostPaths,
    tarball: PathBuf,
    use_prebuilts: bool,
    set_ownership: bool,
}

impl<'a> ChrootCreator<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &SdkConfig, tarball: &Path) -> Self {
        Self {
            runner,
            paths: config.paths(),
            host: config.host.clone(),
            tarball: tarball.to_owned(),
            use_prebuilts: true,
            set_ownership: true,
        }
    }

    /// Passes `--nousepkg` to the bootstrap script when false.
    pub fn with_prebuilts(self, use_prebuilts: bool) -> Self {
        Self {
            use_prebuilts,
            ..self
        }
    }

    /// Whether files are chowned to root and to the mirrored user. Requires root.
    pub fn with_ownership(self, set_ownership: bool) -> Self {
        Self {
            set_ownership,
            ..self
        }
    }

    pub fn run(&self, user: &str, uid: u32, group: &str, gid: u32) -> Result<(), SdkError> {
        let chroot = &self.paths.chroot;
        info!("Creating chroot at '{}'", chroot.display());

        self.extract()?;
        self.updater().set_version(0)?;

        self.copy_timezone()
            .structured(SetupError::Populate { step: "timezone" })?;
        self.add_user(user, uid, gid)?;
        self.add_groups(user, group, gid)?;
        self.populate_home(user, uid, gid)
            .structured(SetupError::Populate {
                step: "home directory",
            })?;
        self.populate_etc(user).structured(SetupError::Populate {
            step: "system configuration",
        })?;

        ChrootMounter::new(self.runner, &self.paths, &self.host).mount_chroot_paths(chroot)?;
        self.bootstrap()?;

        files::write_file(chroot.join(CHROOT_MARKER_FILE), 0o644, b"cros-sdk\n").structured(
            SetupError::Populate {
                step: "compatibility marker",
            },
        )?;

        info!(
            "Chroot created at '{}' for user '{user}' ({uid}:{gid})",
            chroot.display()
        );
        Ok(())
    }

    fn updater(&self) -> ChrootUpdater<'a> {
        ChrootUpdater::new(self.runner, &self.paths)
            .with_owner(self.set_ownership.then_some((0, 0)))
    }

    fn extract(&self) -> Result<(), SdkError> {
        let chroot = &self.paths.chroot;
        if !self.tarball.is_file() {
            return Err(SdkError::new(SetupError::MissingTarball {
                path: self.tarball.display().to_string(),
            }));
        }
        files::create_dirs(chroot).structured(SetupError::Populate {
            step: "create chroot directory",
        })?;

        debug!("Extracting '{}'", self.tarball.display());
        Dependency::Tar
            .cmd()
            .with_args(["--numeric-owner", "-xpf"])
            .with_arg(&self.tarball)
            .with_arg("-C")
            .with_arg(chroot)
            .run_and_check(self.runner)
            .message(format!(
                "Failed to extract '{}' into '{}'",
                self.tarball.display(),
                chroot.display()
            ))?;

        // The tarball root entry overrides the directory's metadata.
        std::fs::set_permissions(chroot, std::fs::Permissions::from_mode(0o755)).structured(
            SetupError::Populate {
                step: "chroot permissions",
            },
        )?;
        if self.set_ownership {
            lchown(chroot, Some(0), Some(0)).structured(SetupError::Populate {
                step: "chroot ownership",
            })?;
        }
        Ok(())
    }

    /// Mirrors the host timezone, as a symlink when the host uses one.
    fn copy_timezone(&self) -> Result<(), Error> {
        let host_localtime = self.host.etc_dir.join("localtime");
        let localtime = self.paths.chroot.join("etc/localtime");

        if host_localtime.is_symlink() {
            let target = std::fs::read_link(&host_localtime)
                .context(format!("Failed to read link {}", host_localtime.display()))?;
            if localtime.symlink_metadata().is_ok() {
                std::fs::remove_file(&localtime)
                    .context(format!("Failed to remove {}", localtime.display()))?;
            }
            files::create_dirs(self.paths.chroot.join("etc"))?;
            symlink(&target, &localtime)
                .context(format!("Failed to create symlink {}", localtime.display()))?;
        } else if !files::copy_if_exists(&host_localtime, &localtime)? {
            debug!("Host has no timezone configured");
        }
        Ok(())
    }

    fn add_user(&self, user: &str, uid: u32, gid: u32) -> Result<(), SdkError> {
        let passwd = self.paths.chroot.join("etc/passwd");
        let accounts = read_accounts(&passwd).structured(SetupError::Populate {
            step: "read passwd",
        })?;
        if accounts.iter().any(|account| account.name == user) {
            return Err(SdkError::new(SetupError::ReservedUser { user: user.into() }));
        }

        files::append_missing_lines(
            &passwd,
            &[&format!("{user}:x:{uid}:{gid}:{user}:/home/{user}:/bin/bash")],
        )
        .structured(SetupError::Populate {
            step: "write passwd",
        })?;
        Ok(())
    }

    fn add_groups(&self, user: &str, group: &str, gid: u32) -> Result<(), SdkError> {
        let path = self.paths.chroot.join("etc/group");
        let mut groups = read_accounts(&path).structured(SetupError::Populate {
            step: "read group",
        })?;

        match groups.iter().find(|entry| entry.name == group) {
            Some(existing) if existing.id != gid => {
                return Err(SdkError::new(SetupError::GroupConflict {
                    group: group.into(),
                    gid,
                    existing: existing.id,
                }));
            }
            Some(_) => {
                debug!("Group '{group}' already exists with gid {gid}, leaving groups as they are");
                return Ok(());
            }
            None => groups.push(AccountEntry {
                name: group.into(),
                id: gid,
                fields: vec![group.into(), "x".into(), gid.to_string(), String::new()],
            }),
        }

        for entry in groups
            .iter_mut()
            .filter(|entry| DEFAULT_SUPPLEMENTAL_GROUPS.contains(&entry.name.as_str()))
        {
            entry.add_member(user);
        }
        for missing in DEFAULT_SUPPLEMENTAL_GROUPS
            .iter()
            .filter(|name| !groups.iter().any(|entry| entry.name == **name))
        {
            warn!("Group '{missing}' does not exist in the chroot, skipping");
        }

        let content = groups
            .iter()
            .map(|entry| format!("{}\n", entry.fields.join(":")))
            .collect::<String>();
        files::write_file(&path, 0o644, content.as_bytes()).structured(SetupError::Populate {
            step: "write group",
        })
    }

    fn populate_home(&self, user: &str, uid: u32, gid: u32) -> Result<(), Error> {
        let home = self.paths.chroot.join("home").join(user);
        let skel = self.paths.chroot.join("etc/skel");
        if skel.is_dir() {
            files::copy_dir_contents(&skel, &home)?;
        } else {
            files::create_dirs(&home)?;
        }

        for (name, target) in [
            ("chromiumos", CHROOT_SOURCE_ROOT),
            ("depot_tools", CHROOT_DEPOT_TOOLS_ROOT),
        ] {
            let link = home.join(name);
            if link.symlink_metadata().is_err() {
                symlink(target, &link)
                    .context(format!("Failed to create symlink {}", link.display()))?;
            }
        }

        files::append_missing_lines(home.join(".bash_profile"), PROFILE_LINES)?;

        if self.set_ownership {
            chown_tree(&home, uid, gid)?;
        }
        Ok(())
    }

    fn populate_etc(&self, user: &str) -> Result<(), Error> {
        let chroot = &self.paths.chroot;
        for dir in BASELINE_DIRS {
            files::create_dirs(chroot.join(dir))?;
        }
        let tmp = chroot.join("tmp");
        files::create_dirs(&tmp)?;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o1777))
            .context(format!("Failed to set permissions of {}", tmp.display()))?;

        let env = formatdoc! {r#"
                PATH="{source}/chromite/bin:{depot_tools}"
                ROOTPATH="{source}/chromite/bin:{depot_tools}"
                CROS_WORKON_SRCROOT="{source}"
                PORTAGE_USERNAME="{user}"
            "#,
            source = CHROOT_SOURCE_ROOT,
            depot_tools = CHROOT_DEPOT_TOOLS_ROOT,
        };
        files::write_file(chroot.join("etc/env.d/99chromiumos"), 0o644, env.as_bytes())?;

        for name in ["hosts", "resolv.conf"] {
            if !files::copy_if_exists(self.host.etc_dir.join(name), chroot.join("etc").join(name))?
            {
                debug!("Host has no /etc/{name}");
            }
        }

        let hostname = hostname::get().context("Failed to read the host name")?;
        files::write_file(
            chroot.join("etc/hostname"),
            0o644,
            format!("{}\n", hostname.to_string_lossy()).as_bytes(),
        )?;

        files::append_missing_lines(chroot.join("etc/locale.gen"), LOCALES)?;
        Ok(())
    }

    fn bootstrap(&self) -> Result<(), SdkError> {
        let mut cmd = Dependency::Bash.cmd();
        cmd.arg(self.paths.source_root.join(MAKE_CHROOT_SCRIPT))
            .arg("--chroot")
            .arg(&self.paths.chroot)
            .arg("--cache_dir")
            .arg(&self.paths.cache_dir);
        if !self.use_prebuilts {
            cmd.arg("--nousepkg");
        }

        info!("Running '{}'", cmd.render_command());
        let status = self
            .runner
            .execute_interactive(&cmd)
            .structured(SetupError::Bootstrap)?;
        if !status.success() {
            return Err(SdkError::new(SetupError::Bootstrap))
                .message(format!("Bootstrap exited with {status}"));
        }
        Ok(())
    }
}

/// One line of a `passwd` or `group` file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AccountEntry {
    name: String,
    /// uid for `passwd`, gid for `group`.
    id: u32,
    fields: Vec<String>,
}

impl AccountEntry {
    fn parse(line: &str) -> Option<Self> {
        let fields = line.split(':').map(str::to_string).collect::<Vec<_>>();
        Some(Self {
            name: fields.first().filter(|name| !name.is_empty())?.clone(),
            id: fields.get(2)?.parse().ok()?,
            fields,
        })
    }

    /// Adds `user` to the member list of a group entry.
    fn add_member(&mut self, user: &str) {
        if self.fields.len() < 4 {
            self.fields.resize(4, String::new());
        }
        let members = &mut self.fields[3];
        if members.split(',').any(|member| member == user) {
            return;
        }
        if !members.is_empty() {
            members.push(',');
        }
        members.push_str(user);
    }
}

fn read_accounts(path: &Path) -> Result<Vec<AccountEntry>, Error> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).context(format!("Failed to read {}", path.display())),
    };
    Ok(content
        .lines()
        .filter_map(|line| {
            let entry = AccountEntry::parse(line);
            if entry.is_none() && !line.trim().is_empty() {
                warn!("Ignoring malformed line in {}: '{line}'", path.display());
            }
            entry
        })
        .collect())
}

fn chown_tree(path: &Path, uid: u32, gid: u32) -> Result<(), Error> {
    lchown(path, Some(uid), Some(gid))
        .context(format!("Failed to change owner of {}", path.display()))?;
    if path.is_dir() && !path.is_symlink() {
        for entry in std::fs::read_dir(path)
            .context(format!("Failed to read directory {}", path.display()))?
        {
            chown_tree(&entry.context("Failed to read entry")?.path(), uid, gid)?;
        }
    }
    Ok(())
}

/// Checks that the chroot directory is owned by `owner` with mode 0755, logging what is off.
pub fn is_chroot_dir_valid(path: &Path, owner: u32) -> Result<bool, SdkError> {
    let inspect_error = || SetupError::Populate {
        step: "inspect chroot directory",
    };
    let actual_owner = files::get_owner_uid(path).structured(inspect_error())?;
    let mode = files::get_mode(path).structured(inspect_error())?;

    let mut valid = true;
    if actual_owner != owner {
        warn!(
            "Chroot '{}' is owned by uid {actual_owner}, expected {owner}",
            path.display()
        );
        valid = false;
    }
    if mode != 0o755 {
        warn!("Chroot '{}' has mode {mode:o}, expected 755", path.display());
        valid = false;
    }
    Ok(valid)
}
