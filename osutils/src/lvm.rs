use std::path::{Path, PathBuf};

use log::debug;

use sdk_api::error::{ReportError, SdkError, SdkResultExt, ToolError};

use crate::dependencies::{CommandRunner, Dependency, DependencyResultExt};

/// A logical volume as reported by `lvs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolume {
    pub name: String,
    /// Thin pool the volume lives in, empty for the pool itself.
    pub pool: String,
    /// The ten character `lv_attr` string, e.g. `Vwi-a-tz--`.
    pub attr: String,
}

impl LogicalVolume {
    /// The first attr character is `V` for thin volumes.
    pub fn is_thin_volume(&self) -> bool {
        self.attr.starts_with('V')
    }
}

/// Wraps the LVM2 command line tools.
pub struct VolumeManager<'a> {
    runner: &'a dyn CommandRunner,
    dev_dir: PathBuf,
}

impl<'a> VolumeManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self::with_dev_dir(runner, "/dev")
    }

    /// Uses `dev_dir` instead of `/dev` when computing device node paths.
    pub fn with_dev_dir(runner: &'a dyn CommandRunner, dev_dir: impl AsRef<Path>) -> Self {
        Self {
            runner,
            dev_dir: dev_dir.as_ref().to_owned(),
        }
    }

    /// Device node of a logical volume, e.g. `/dev/<vg>/<lv>`.
    pub fn lv_path(&self, vg: &str, lv: &str) -> PathBuf {
        self.dev_dir.join(vg).join(lv)
    }

    /// Lists `(vg_name, pv_name)` pairs for every physical volume LVM knows about.
    pub fn volume_groups(&self) -> Result<Vec<(String, String)>, SdkError> {
        let output = Dependency::Vgs
            .cmd()
            .with_args([
                "-q",
                "--noheadings",
                "-o",
                "vg_name,pv_name",
                "--unbuffered",
                "--separator",
                "\t",
            ])
            .output_and_check(self.runner)
            .message("Failed to list volume groups")?;

        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.split_once('\t')
                    .map(|(vg, pv)| (vg.trim().to_string(), pv.trim().to_string()))
                    .structured(ToolError::UnexpectedOutput {
                        binary: Dependency::Vgs.name(),
                    })
                    .message(format!("Unexpected vgs line '{line}'"))
            })
            .collect()
    }

    /// The volume group living on `device`, if any.
    pub fn vg_for_device(&self, device: impl AsRef<Path>) -> Result<Option<String>, SdkError> {
        let device = device.as_ref().to_string_lossy();
        Ok(self
            .volume_groups()?
            .into_iter()
            .find(|(_, pv)| *pv == device)
            .map(|(vg, _)| vg))
    }

    pub fn create_vg(&self, vg: &str, device: impl AsRef<Path>) -> Result<(), SdkError> {
        Dependency::Vgcreate
            .cmd()
            .with_args(["-q", vg])
            .with_arg(device.as_ref())
            .run_and_check(self.runner)
            .message(format!(
                "Failed to create volume group '{vg}' on '{}'",
                device.as_ref().display()
            ))
    }

    pub fn activate_vg(&self, vg: &str) -> Result<(), SdkError> {
        self.vgchange(vg, "-ay")
    }

    pub fn deactivate_vg(&self, vg: &str) -> Result<(), SdkError> {
        self.vgchange(vg, "-an")
    }

    fn vgchange(&self, vg: &str, flag: &str) -> Result<(), SdkError> {
        Dependency::Vgchange
            .cmd()
            .with_args(["-q", flag, vg])
            .run_and_check(self.runner)
            .message(format!("Failed to run 'vgchange {flag}' on '{vg}'"))
    }

    pub fn logical_volumes(&self, vg: &str) -> Result<Vec<LogicalVolume>, SdkError> {
        let output = Dependency::Lvs
            .cmd()
            .with_args([
                "-q",
                "--noheadings",
                "-o",
                "lv_name,pool_lv,lv_attr",
                "--unbuffered",
                "--separator",
                "\t",
                vg,
            ])
            .output_and_check(self.runner)
            .message(format!("Failed to list logical volumes in '{vg}'"))?;

        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                let fields = line.split('\t').map(str::trim).collect::<Vec<_>>();
                match fields[..] {
                    [name, pool, attr] => Ok(LogicalVolume {
                        name: name.into(),
                        pool: pool.into(),
                        attr: attr.into(),
                    }),
                    _ => Err::<LogicalVolume, _>(SdkError::new(ToolError::UnexpectedOutput {
                        binary: Dependency::Lvs.name(),
                    }))
                    .message(format!("Unexpected lvs line '{line}'")),
                }
            })
            .collect()
    }

    pub fn lv_exists(&self, vg: &str, lv: &str) -> Result<bool, SdkError> {
        Ok(self
            .logical_volumes(vg)?
            .iter()
            .any(|volume| volume.name == lv))
    }

    /// Creates a thin pool and a thin volume inside it in one step.
    pub fn create_thin_pool_and_lv(
        &self,
        vg: &str,
        pool: &str,
        pool_size: &str,
        lv: &str,
        lv_size: &str,
    ) -> Result<(), SdkError> {
        debug!("Creating thin pool '{vg}/{pool}' ({pool_size}) with volume '{lv}' ({lv_size})");
        Dependency::Lvcreate
            .cmd()
            .with_args([
                "-q".to_string(),
                format!("-L{pool_size}"),
                "-T".into(),
                format!("{vg}/{pool}"),
                format!("-V{lv_size}"),
                "-n".into(),
                lv.into(),
            ])
            .run_and_check(self.runner)
            .message(format!("Failed to create logical volume '{vg}/{lv}'"))
    }

    pub fn create_snapshot(&self, vg: &str, origin: &str, name: &str) -> Result<(), SdkError> {
        Dependency::Lvcreate
            .cmd()
            .with_args(["-q", "-s", "-n", name])
            .with_arg(format!("{vg}/{origin}"))
            .run_and_check(self.runner)
            .message(format!("Failed to snapshot '{vg}/{origin}' as '{name}'"))
    }

    pub fn rename_lv(&self, vg: &str, from: &str, to: &str) -> Result<(), SdkError> {
        Dependency::Lvrename
            .cmd()
            .with_args(["-q", vg, from, to])
            .run_and_check(self.runner)
            .message(format!("Failed to rename '{vg}/{from}' to '{to}'"))
    }

    pub fn remove_lv(&self, vg: &str, lv: &str) -> Result<(), SdkError> {
        Dependency::Lvremove
            .cmd()
            .with_args(["-q", "-f"])
            .with_arg(format!("{vg}/{lv}"))
            .run_and_check(self.runner)
            .message(format!("Failed to remove logical volume '{vg}/{lv}'"))
    }

    /// Clears the activation skip flag that thin snapshots get by default.
    pub fn clear_activation_skip(&self, vg: &str, lv: &str) -> Result<(), SdkError> {
        self.lvchange(vg, lv, "-kn")
    }

    pub fn activate_lv(&self, vg: &str, lv: &str) -> Result<(), SdkError> {
        self.lvchange(vg, lv, "-ay")
    }

    fn lvchange(&self, vg: &str, lv: &str, flag: &str) -> Result<(), SdkError> {
        Dependency::Lvchange
            .cmd()
            .with_args(["-q", flag])
            .with_arg(format!("{vg}/{lv}"))
            .run_and_check(self.runner)
            .message(format!("Failed to run 'lvchange {flag}' on '{vg}/{lv}'"))
    }

    /// Refreshes LVM's device cache, optionally only for one device.
    pub fn pvscan_cache(&self, device: Option<&Path>) -> Result<(), SdkError> {
        let mut cmd = Dependency::Pvscan.cmd().with_args(["-q", "--cache"]);
        if let Some(device) = device {
            cmd.arg(device);
        }
        cmd.run_and_check(self.runner)
            .message("Failed to rescan LVM metadata")
    }
}

/// Device-mapper name of a logical volume, with dashes in either half doubled.
#[cfg(any(test, feature = "test-utilities"))]
pub fn mapper_name(vg: &str, lv: &str) -> String {
    format!("{}-{}", vg.replace('-', "--"), lv.replace('-', "--"))
}

/// Splits a device-mapper name back into `(vg, lv)`.
pub fn parse_mapper_name(name: &str) -> Option<(String, String)> {
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'-' {
            if bytes.get(i + 1) == Some(&b'-') {
                i += 2;
                continue;
            }
            let (vg, lv) = (&name[..i], &name[i + 1..]);
            if vg.is_empty() || lv.is_empty() {
                return None;
            }
            return Some((vg.replace("--", "-"), lv.replace("--", "-")));
        }
        i += 1;
    }
    None
}
