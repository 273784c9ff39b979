use std::{
    cell::RefCell,
    collections::BTreeMap,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::ExitStatus,
};

use crate::{
    dependencies::{Command, CommandOutput, CommandRunner, Dependency, DependencyError, HostRunner},
    lvm,
};

type Predicate = Box<dyn Fn(&Command) -> bool>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeVolume {
    pub pool: String,
    pub thin: bool,
    pub active: bool,
    pub skip_activation: bool,
    /// Stand-in for the filesystem contents, copied by snapshots and moved by renames.
    pub content: String,
}

impl FakeVolume {
    fn attr(&self) -> String {
        format!(
            "{}wi-{}-tz-{}",
            if self.thin { 'V' } else { 't' },
            if self.active { 'a' } else { '-' },
            if self.skip_activation { 'k' } else { '-' },
        )
    }
}

#[derive(Debug, Default)]
struct FakeGroup {
    pv: String,
    active: bool,
    lvs: BTreeMap<String, FakeVolume>,
}

#[derive(Debug, Default)]
struct HostState {
    next_loop: u32,
    loops: BTreeMap<String, PathBuf>,
    vgs: BTreeMap<String, FakeGroup>,
    mounts: Vec<(String, PathBuf, String)>,
}

/// An in-memory model of the loop/LVM/mount state of a host, driven by the same argv the real
/// tools receive. Mount state is mirrored to a `/proc/mounts`-formatted file and LV device
/// nodes to plain files under a fake `/dev`, so code reading either sees a consistent host.
pub struct FakeHost {
    state: RefCell<HostState>,
    calls: RefCell<Vec<Command>>,
    failures: RefCell<Vec<(Predicate, Option<usize>)>>,
    passthrough: Vec<Dependency>,
    mounts_file: PathBuf,
    dev_dir: PathBuf,
}

impl FakeHost {
    /// Creates a host whose mount table and device nodes live under `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let host = Self {
            state: RefCell::default(),
            calls: RefCell::default(),
            failures: RefCell::default(),
            passthrough: Vec::new(),
            mounts_file: root.as_ref().join("mounts"),
            dev_dir: root.as_ref().join("dev"),
        };
        std::fs::create_dir_all(&host.dev_dir).unwrap();
        host.sync_files();
        host
    }

    /// Runs `dependency` for real instead of simulating it.
    pub fn with_passthrough(mut self, dependency: Dependency) -> Self {
        self.passthrough.push(dependency);
        self
    }

    pub fn mounts_file(&self) -> &Path {
        &self.mounts_file
    }

    pub fn dev_dir(&self) -> &Path {
        &self.dev_dir
    }

    /// Makes every matching command fail with exit status 5.
    pub fn fail_when(&self, predicate: impl Fn(&Command) -> bool + 'static) {
        self.failures
            .borrow_mut()
            .push((Box::new(predicate), None));
    }

    /// Makes the next `times` matching commands fail with exit status 5.
    pub fn fail_times(&self, times: usize, predicate: impl Fn(&Command) -> bool + 'static) {
        self.failures
            .borrow_mut()
            .push((Box::new(predicate), Some(times)));
    }

    /// Every command run so far, rendered.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(Command::render_command)
            .collect()
    }

    /// Argument lists of every invocation of `dependency` so far.
    pub fn calls_to(&self, dependency: Dependency) -> Vec<Vec<String>> {
        self.calls
            .borrow()
            .iter()
            .filter(|command| command.dependency() == dependency)
            .map(Command::arg_strings)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    pub fn loop_devices(&self) -> BTreeMap<String, PathBuf> {
        self.state.borrow().loops.clone()
    }

    pub fn vg_names(&self) -> Vec<String> {
        self.state.borrow().vgs.keys().cloned().collect()
    }

    pub fn lv_names(&self, vg: &str) -> Vec<String> {
        self.state
            .borrow()
            .vgs
            .get(vg)
            .map(|group| group.lvs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn volume(&self, vg: &str, lv: &str) -> Option<FakeVolume> {
        self.state
            .borrow()
            .vgs
            .get(vg)
            .and_then(|group| group.lvs.get(lv))
            .cloned()
    }

    /// Replaces the simulated filesystem contents of a volume.
    pub fn set_content(&self, vg: &str, lv: &str, content: &str) {
        let mut state = self.state.borrow_mut();
        let volume = state
            .vgs
            .get_mut(vg)
            .and_then(|group| group.lvs.get_mut(lv))
            .unwrap_or_else(|| panic!("No volume {vg}/{lv}"));
        volume.content = content.into();
    }

    /// Registers a pre-existing volume group on `pv`.
    pub fn add_volume_group(&self, vg: &str, pv: &str) {
        self.state.borrow_mut().vgs.insert(
            vg.into(),
            FakeGroup {
                pv: pv.into(),
                active: false,
                lvs: BTreeMap::new(),
            },
        );
    }

    /// Registers a pre-existing loop device association.
    pub fn add_loop_device(&self, device: &str, image: impl AsRef<Path>) {
        self.state
            .borrow_mut()
            .loops
            .insert(device.into(), image.as_ref().to_owned());
    }

    pub fn add_mount(&self, source: &str, target: impl AsRef<Path>, fstype: &str) {
        self.state.borrow_mut().mounts.push((
            source.into(),
            target.as_ref().to_owned(),
            fstype.into(),
        ));
        self.sync_files();
    }

    pub fn mount_targets(&self) -> Vec<PathBuf> {
        self.state
            .borrow()
            .mounts
            .iter()
            .map(|(_, target, _)| target.clone())
            .collect()
    }

    fn should_fail(&self, command: &Command) -> bool {
        let mut failures = self.failures.borrow_mut();
        for (predicate, remaining) in failures.iter_mut() {
            if !predicate(command) {
                continue;
            }
            match remaining {
                None => return true,
                Some(0) => continue,
                Some(n) => {
                    *n -= 1;
                    return true;
                }
            }
        }
        false
    }

    fn sync_files(&self) {
        let state = self.state.borrow();
        let table = state
            .mounts
            .iter()
            .map(|(source, target, fstype)| {
                format!(
                    "{source} {} {fstype} rw 0 0\n",
                    target.to_string_lossy().replace(' ', "\\040")
                )
            })
            .collect::<String>();
        std::fs::write(&self.mounts_file, table).unwrap();

        for (vg, group) in &state.vgs {
            for (lv, volume) in &group.lvs {
                let node = self.dev_dir.join(vg).join(lv);
                if group.active && volume.active {
                    std::fs::create_dir_all(self.dev_dir.join(vg)).unwrap();
                    std::fs::write(&node, "").unwrap();
                } else if node.exists() {
                    std::fs::remove_file(&node).unwrap();
                }
            }
        }
    }

    fn remove_stale_nodes(&self, vg: &str, lv: &str) {
        let node = self.dev_dir.join(vg).join(lv);
        if node.exists() {
            std::fs::remove_file(node).unwrap();
        }
    }

    fn simulate(&self, command: &Command) -> (i32, String, String) {
        let args = command
            .arg_strings()
            .into_iter()
            .filter(|arg| arg != "-q")
            .collect::<Vec<_>>();
        let args = args.iter().map(String::as_str).collect::<Vec<_>>();
        let result = match command.dependency() {
            Dependency::Losetup => self.losetup(&args),
            Dependency::Vgs => self.vgs(),
            Dependency::Vgcreate => self.vgcreate(&args),
            Dependency::Vgchange => self.vgchange(&args),
            Dependency::Lvs => self.lvs(&args),
            Dependency::Lvcreate => self.lvcreate(&args),
            Dependency::Lvrename => self.lvrename(&args),
            Dependency::Lvchange => self.lvchange(&args),
            Dependency::Lvremove => self.lvremove(&args),
            Dependency::Mount => self.mount(&args),
            Dependency::Umount => self.umount(&args),
            Dependency::Mountpoint => {
                let target = Path::new(args.last().copied().unwrap_or_default());
                if self.mount_targets().iter().any(|t| t == target) {
                    Ok(String::new())
                } else {
                    Err((32, format!("{} is not a mountpoint\n", target.display())))
                }
            }
            Dependency::Fstrim => Ok(format!(
                "{}: 0 B (0 bytes) trimmed\n",
                args.last().copied().unwrap_or_default()
            )),
            _ => Ok(String::new()),
        };
        self.sync_files();
        match result {
            Ok(stdout) => (0, stdout, String::new()),
            Err((code, stderr)) => (code, String::new(), stderr),
        }
    }

    fn losetup(&self, args: &[&str]) -> Result<String, (i32, String)> {
        let mut state = self.state.borrow_mut();
        match args {
            ["-j", image] => Ok(state
                .loops
                .iter()
                .filter(|(_, bound)| bound.as_path() == Path::new(image))
                .map(|(device, bound)| format!("{device}: [0]:0 ({})\n", bound.display()))
                .collect()),
            ["--show", "-f", image] => {
                let device = format!("/dev/loop{}", state.next_loop);
                state.next_loop += 1;
                state.loops.insert(device.clone(), PathBuf::from(image));
                Ok(format!("{device}\n"))
            }
            ["-d", device] => match state.loops.remove(*device) {
                Some(_) => Ok(String::new()),
                None => Err((1, format!("losetup: {device}: detach failed\n"))),
            },
            _ => Err((1, format!("losetup: unsupported arguments {args:?}\n"))),
        }
    }

    fn vgs(&self) -> Result<String, (i32, String)> {
        Ok(self
            .state
            .borrow()
            .vgs
            .iter()
            .map(|(vg, group)| format!("  {vg}\t{}\n", group.pv))
            .collect())
    }

    fn vgcreate(&self, args: &[&str]) -> Result<String, (i32, String)> {
        let [vg, pv] = args else {
            return Err((3, format!("vgcreate: unsupported arguments {args:?}\n")));
        };
        let mut state = self.state.borrow_mut();
        if state.vgs.contains_key(*vg) {
            return Err((5, format!("A volume group called {vg} already exists.\n")));
        }
        state.vgs.insert(
            vg.to_string(),
            FakeGroup {
                pv: pv.to_string(),
                active: true,
                lvs: BTreeMap::new(),
            },
        );
        Ok(String::new())
    }

    fn vgchange(&self, args: &[&str]) -> Result<String, (i32, String)> {
        let [flag, vg] = args else {
            return Err((3, format!("vgchange: unsupported arguments {args:?}\n")));
        };
        let mut state = self.state.borrow_mut();
        let group = state
            .vgs
            .get_mut(*vg)
            .ok_or_else(|| (5, format!("Volume group \"{vg}\" not found\n")))?;
        let active = *flag == "-ay";
        group.active = active;
        for volume in group.lvs.values_mut() {
            volume.active = active && !volume.skip_activation;
        }
        Ok(String::new())
    }

    fn lvs(&self, args: &[&str]) -> Result<String, (i32, String)> {
        let vg = args.last().copied().unwrap_or_default();
        let state = self.state.borrow();
        let group = state
            .vgs
            .get(vg)
            .ok_or_else(|| (5, format!("Volume group \"{vg}\" not found\n")))?;
        Ok(group
            .lvs
            .iter()
            .map(|(name, volume)| format!("  {name}\t{}\t{}\n", volume.pool, volume.attr()))
            .collect())
    }

    fn lvcreate(&self, args: &[&str]) -> Result<String, (i32, String)> {
        let value_of = |flag: &str| {
            args.iter()
                .position(|arg| *arg == flag)
                .and_then(|i| args.get(i + 1))
                .copied()
        };
        let name = value_of("-n").ok_or_else(|| (3, "lvcreate: missing -n\n".to_string()))?;
        let mut state = self.state.borrow_mut();

        if args.contains(&"-s") {
            let origin = args.last().copied().unwrap_or_default();
            let (vg, origin) = origin
                .split_once('/')
                .ok_or_else(|| (3, format!("lvcreate: bad origin {origin}\n")))?;
            let group = state
                .vgs
                .get_mut(vg)
                .ok_or_else(|| (5, format!("Volume group \"{vg}\" not found\n")))?;
            if group.lvs.contains_key(name) {
                return Err((
                    5,
                    format!("Logical Volume \"{name}\" already exists in volume group \"{vg}\"\n"),
                ));
            }
            let source = group
                .lvs
                .get(origin)
                .cloned()
                .ok_or_else(|| (5, format!("Failed to find logical volume \"{vg}/{origin}\"\n")))?;
            group.lvs.insert(
                name.into(),
                FakeVolume {
                    active: false,
                    skip_activation: true,
                    ..source
                },
            );
            return Ok(String::new());
        }

        let pool_path = value_of("-T").ok_or_else(|| (3, "lvcreate: missing -T\n".to_string()))?;
        let (vg, pool) = pool_path
            .split_once('/')
            .ok_or_else(|| (3, format!("lvcreate: bad pool {pool_path}\n")))?;
        let group = state
            .vgs
            .get_mut(vg)
            .ok_or_else(|| (5, format!("Volume group \"{vg}\" not found\n")))?;
        if group.lvs.contains_key(name) || group.lvs.contains_key(pool) {
            return Err((5, format!("Logical Volume \"{name}\" already exists\n")));
        }
        let active = group.active;
        group.lvs.insert(
            pool.into(),
            FakeVolume {
                pool: String::new(),
                thin: false,
                active,
                skip_activation: false,
                content: String::new(),
            },
        );
        group.lvs.insert(
            name.into(),
            FakeVolume {
                pool: pool.into(),
                thin: true,
                active,
                skip_activation: false,
                content: String::new(),
            },
        );
        Ok(String::new())
    }

    fn lvrename(&self, args: &[&str]) -> Result<String, (i32, String)> {
        let [vg, from, to] = args else {
            return Err((3, format!("lvrename: unsupported arguments {args:?}\n")));
        };
        {
            let mut state = self.state.borrow_mut();
            let group = state
                .vgs
                .get_mut(*vg)
                .ok_or_else(|| (5, format!("Volume group \"{vg}\" not found\n")))?;
            if group.lvs.contains_key(*to) {
                return Err((5, format!("Logical Volume \"{to}\" already exists\n")));
            }
            let volume = group
                .lvs
                .remove(*from)
                .ok_or_else(|| (5, format!("Existing logical volume \"{from}\" not found\n")))?;
            group.lvs.insert(to.to_string(), volume);
        }
        self.remove_stale_nodes(vg, from);
        Ok(String::new())
    }

    fn lvchange(&self, args: &[&str]) -> Result<String, (i32, String)> {
        let [flag, path] = args else {
            return Err((3, format!("lvchange: unsupported arguments {args:?}\n")));
        };
        let (vg, lv) = path
            .split_once('/')
            .ok_or_else(|| (3, format!("lvchange: bad path {path}\n")))?;
        let mut state = self.state.borrow_mut();
        let volume = state
            .vgs
            .get_mut(vg)
            .and_then(|group| group.lvs.get_mut(lv))
            .ok_or_else(|| (5, format!("Failed to find logical volume \"{path}\"\n")))?;
        match *flag {
            "-kn" => volume.skip_activation = false,
            "-ay" => volume.active = true,
            "-an" => volume.active = false,
            _ => return Err((3, format!("lvchange: unsupported flag {flag}\n"))),
        }
        Ok(String::new())
    }

    fn lvremove(&self, args: &[&str]) -> Result<String, (i32, String)> {
        let path = args.last().copied().unwrap_or_default();
        let (vg, lv) = path
            .split_once('/')
            .ok_or_else(|| (3, format!("lvremove: bad path {path}\n")))?;
        {
            let mut state = self.state.borrow_mut();
            state
                .vgs
                .get_mut(vg)
                .and_then(|group| group.lvs.remove(lv))
                .ok_or_else(|| (5, format!("Failed to find logical volume \"{path}\"\n")))?;
        }
        self.remove_stale_nodes(vg, lv);
        Ok(String::new())
    }

    fn mount(&self, args: &[&str]) -> Result<String, (i32, String)> {
        if args.iter().any(|arg| arg.starts_with("--make-")) {
            return Ok(String::new());
        }
        let [.., source, target] = args else {
            return Err((1, format!("mount: unsupported arguments {args:?}\n")));
        };
        let fstype = args
            .iter()
            .position(|arg| *arg == "-t")
            .and_then(|i| args.get(i + 1))
            .copied()
            .unwrap_or("none");

        // The kernel reports LVM volumes by their device-mapper name.
        let source = match Path::new(source).strip_prefix(&self.dev_dir) {
            Ok(relative) => {
                let mut parts = relative.iter().map(|part| part.to_string_lossy());
                match (parts.next(), parts.next()) {
                    (Some(vg), Some(lv)) => format!("/dev/mapper/{}", lvm::mapper_name(&vg, &lv)),
                    _ => source.to_string(),
                }
            }
            Err(_) => source.to_string(),
        };

        self.state
            .borrow_mut()
            .mounts
            .push((source, PathBuf::from(target), fstype.to_string()));
        Ok(String::new())
    }

    fn umount(&self, args: &[&str]) -> Result<String, (i32, String)> {
        let recursive = args.contains(&"-R");
        let target = Path::new(args.last().copied().unwrap_or_default());
        let mut state = self.state.borrow_mut();
        let before = state.mounts.len();
        if recursive {
            state.mounts.retain(|(_, t, _)| !t.starts_with(target));
        } else if let Some(i) = state.mounts.iter().rposition(|(_, t, _)| t == target) {
            state.mounts.remove(i);
        }
        if state.mounts.len() == before {
            return Err((32, format!("umount: {}: not mounted.\n", target.display())));
        }
        Ok(String::new())
    }
}

impl CommandRunner for FakeHost {
    fn execute(&self, command: &Command) -> Result<CommandOutput, Box<DependencyError>> {
        self.calls.borrow_mut().push(command.clone());
        if self.passthrough.contains(&command.dependency()) {
            return HostRunner.execute(command);
        }
        if self.should_fail(command) {
            return Ok(CommandOutput::from_parts(command, 5, "", "injected failure\n"));
        }
        let (code, stdout, stderr) = self.simulate(command);
        Ok(CommandOutput::from_parts(command, code, &stdout, &stderr))
    }

    fn execute_interactive(&self, command: &Command) -> Result<ExitStatus, Box<DependencyError>> {
        let output = self.execute(command)?;
        Ok(ExitStatus::from_raw(output.code().unwrap_or(1) << 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lvm_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());

        let out = Dependency::Losetup
            .cmd()
            .with_args(["--show", "-f", "/c.img"])
            .output_and_check(&host)
            .unwrap();
        assert_eq!(out, "/dev/loop0\n");

        Dependency::Vgcreate
            .cmd()
            .with_args(["-q", "vg", "/dev/loop0"])
            .run_and_check(&host)
            .unwrap();
        Dependency::Lvcreate
            .cmd()
            .with_args(["-q", "-L1G", "-T", "vg/thinpool", "-V2G", "-n", "chroot"])
            .run_and_check(&host)
            .unwrap();
        assert_eq!(host.lv_names("vg"), vec!["chroot", "thinpool"]);
        assert!(host.dev_dir().join("vg/chroot").exists());

        host.set_content("vg", "chroot", "v1");
        Dependency::Lvcreate
            .cmd()
            .with_args(["-q", "-s", "-n", "snap", "vg/chroot"])
            .run_and_check(&host)
            .unwrap();
        let snap = host.volume("vg", "snap").unwrap();
        assert_eq!(snap.content, "v1");
        assert_eq!(snap.attr(), "Vwi---tz-k");

        Dependency::Vgchange
            .cmd()
            .with_args(["-q", "-an", "vg"])
            .run_and_check(&host)
            .unwrap();
        assert!(!host.dev_dir().join("vg/chroot").exists());
    }

    #[test]
    fn test_mounts_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::new(dir.path());

        Dependency::Mount
            .cmd()
            .with_args(["-t", "proc", "proc", "/c/proc"])
            .run_and_check(&host)
            .unwrap();
        let table = std::fs::read_to_string(host.mounts_file()).unwrap();
        assert_eq!(table, "proc /c/proc proc rw 0 0\n");

        host.fail_times(1, |command| command.dependency() == Dependency::Umount);
        assert!(Dependency::Umount
            .cmd()
            .with_args(["-R", "/c"])
            .run_and_check(&host)
            .is_err());
        Dependency::Umount
            .cmd()
            .with_args(["-R", "/c"])
            .run_and_check(&host)
            .unwrap();
        assert!(host.mount_targets().is_empty());
        assert_eq!(host.calls_to(Dependency::Umount).len(), 2);
    }
}
