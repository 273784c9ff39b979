use std::{
    borrow::Cow,
    ffi::{OsStr, OsString},
    io,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{Command as StdCommand, ExitStatus, Output},
};

use log::trace;
use strum_macros::IntoStaticStr;

use sdk_api::error::{EnvironmentError, ErrorKind, SdkError, SdkResultExt, ToolError};

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Failed to find dependency '{dependency}': {source}")]
    NotFound {
        dependency: Dependency,
        #[source]
        source: which::Error,
    },

    #[error("Failed to execute dependency '{dependency}': {inner}")]
    CouldNotExecute {
        dependency: Dependency,
        #[source]
        inner: io::Error,
    },

    #[error("Dependency '{dependency}' finished unsuccessfully: {explanation}\nCmdline: {rendered_command}\n{output}")]
    ExecutionFailed {
        dependency: Dependency,
        rendered_command: String,
        code: Option<i32>,
        signal: Option<i32>,
        stdout: String,
        stderr: String,
        explanation: String,
        output: String,
    },
}

impl From<DependencyError> for SdkError {
    #[track_caller]
    fn from(value: DependencyError) -> Self {
        let kind: ErrorKind = match &value {
            DependencyError::NotFound { dependency, .. } => {
                EnvironmentError::MissingBinary {
                    binary: dependency.name(),
                }
                .into()
            }
            DependencyError::CouldNotExecute { dependency, .. } => {
                ToolError::CommandCouldNotExecute {
                    binary: dependency.name(),
                }
                .into()
            }
            DependencyError::ExecutionFailed {
                dependency,
                explanation,
                ..
            } => ToolError::CommandFailed {
                binary: dependency.name(),
                explanation: explanation.clone(),
            }
            .into(),
        };
        // The source keeps the rendered command line and the captured output.
        SdkError::with_source(kind, value.into())
    }
}

pub trait DependencyResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, SdkError>;
}

impl<T> DependencyResultExt<T> for Result<T, Box<DependencyError>> {
    #[track_caller]
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, SdkError> {
        let result: Result<T, SdkError> = self.map_err(|e| (*e).into());
        result.message(context)
    }
}

/// Enum of runtime and test dependencies used in the code base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Dependency {
    Bash,
    Chroot,
    Fstrim,
    Fuser,
    Losetup,
    Lsof,
    Lvchange,
    Lvcreate,
    Lvremove,
    Lvrename,
    Lvs,
    Mke2fs,
    Mount,
    Mountpoint,
    Ps,
    Pvscan,
    Tar,
    Umount,
    Vgchange,
    Vgcreate,
    Vgs,
    // Test dependencies
    #[cfg(test)]
    DoesNotExist,
    #[cfg(test)]
    Echo,
    #[cfg(test)]
    False,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

impl Dependency {
    /// Tools the chroot lifecycle cannot work without.
    pub const REQUIRED: &'static [Dependency] = &[
        Dependency::Losetup,
        Dependency::Lvchange,
        Dependency::Lvcreate,
        Dependency::Lvremove,
        Dependency::Lvrename,
        Dependency::Lvs,
        Dependency::Mke2fs,
        Dependency::Mount,
        Dependency::Pvscan,
        Dependency::Tar,
        Dependency::Umount,
        Dependency::Vgchange,
        Dependency::Vgcreate,
        Dependency::Vgs,
    ];

    /// Gets the path for a dependency not in $PATH
    fn path_override(&self) -> Option<PathBuf> {
        Some(PathBuf::from(match self {
            Self::Bash => "/bin/bash",
            _ => return None,
        }))
    }

    /// Gets the name of the dependency
    ///
    /// For example, Dependency::Lvcreate => "lvcreate"
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Checks if the dependency is present in the system
    pub fn exists(&self) -> bool {
        self.path().is_ok()
    }

    /// Gets the path of the dependency
    pub fn path(&self) -> Result<PathBuf, Box<DependencyError>> {
        which::which(match self.path_override() {
            Some(path) => path,
            None => self.name().into(),
        })
        .map_err(|source| {
            Box::new(DependencyError::NotFound {
                dependency: *self,
                source,
            })
        })
    }

    /// Converts the dependency to a new Command instance
    /// (Note this does not create a std::process::Command instance)
    pub fn cmd(&self) -> Command {
        Command {
            dependency: *self,
            args: vec![],
        }
    }
}

/// Executes commands on behalf of the rest of the crate.
///
/// Production code uses [`HostRunner`]; tests substitute an in-memory implementation so the
/// sequencing logic can be exercised without touching the host.
pub trait CommandRunner {
    /// Runs the command to completion and captures its output.
    fn execute(&self, command: &Command) -> Result<CommandOutput, Box<DependencyError>>;

    /// Runs the command attached to the caller's terminal.
    fn execute_interactive(&self, command: &Command) -> Result<ExitStatus, Box<DependencyError>>;
}

/// Runs commands as real host processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl HostRunner {
    fn std_command(command: &Command) -> Result<StdCommand, Box<DependencyError>> {
        let mut cmd = StdCommand::new(command.dependency.path()?);
        cmd.args(&command.args);
        Ok(cmd)
    }
}

impl CommandRunner for HostRunner {
    fn execute(&self, command: &Command) -> Result<CommandOutput, Box<DependencyError>> {
        let rendered_command = command.render_command();
        trace!("Executing '{rendered_command}'");
        let output = Self::std_command(command)?.output().map_err(|inner| {
            DependencyError::CouldNotExecute {
                dependency: command.dependency,
                inner,
            }
        })?;
        let output = CommandOutput::new(command, output);
        trace!(
            "Executed '{rendered_command}': {}. Report:\n{}",
            output.explain_exit(),
            output.output_report(),
        );
        Ok(output)
    }

    fn execute_interactive(&self, command: &Command) -> Result<ExitStatus, Box<DependencyError>> {
        let rendered_command = command.render_command();
        trace!("Executing interactively '{rendered_command}'");
        Self::std_command(command)?.status().map_err(|inner| {
            Box::new(DependencyError::CouldNotExecute {
                dependency: command.dependency,
                inner,
            })
        })
    }
}

#[derive(Debug, Clone)]
pub struct Command {
    dependency: Dependency,
    args: Vec<OsString>,
}

impl Command {
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn with_arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg.as_ref());
        }
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args(args);
        self
    }

    pub fn dependency(&self) -> Dependency {
        self.dependency
    }

    /// Arguments as lossy UTF-8 strings, mostly useful for matching in tests.
    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    pub fn output(&self, runner: &dyn CommandRunner) -> Result<CommandOutput, Box<DependencyError>> {
        runner.execute(self)
    }

    pub fn run_and_check(&self, runner: &dyn CommandRunner) -> Result<(), Box<DependencyError>> {
        self.output(runner)?.check()
    }

    pub fn output_and_check(
        &self,
        runner: &dyn CommandRunner,
    ) -> Result<String, Box<DependencyError>> {
        self.output(runner)?.check_output()
    }

    pub fn render_command(&self) -> String {
        if self.args.is_empty() {
            self.dependency.to_string()
        } else {
            format!(
                "{} {}",
                self.dependency,
                self.args
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .map(|arg| if arg.contains(' ') {
                        format!("'{arg}'")
                    } else {
                        arg.into()
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        }
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    rendered_command: String,
    dependency: Dependency,
    inner: Output,
}

impl CommandOutput {
    pub fn new(command: &Command, inner: Output) -> Self {
        Self {
            rendered_command: command.render_command(),
            dependency: command.dependency,
            inner,
        }
    }

    /// Builds an output from its parts, for runners that do not spawn processes.
    pub fn from_parts(command: &Command, code: i32, stdout: &str, stderr: &str) -> Self {
        Self::new(
            command,
            Output {
                status: ExitStatus::from_raw(code << 8),
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
            },
        )
    }

    /// Checks if the process exited successfully
    pub fn success(&self) -> bool {
        self.inner.status.success()
    }

    /// Gets the exit code of the process, if it exited normally
    pub fn code(&self) -> Option<i32> {
        self.inner.status.code()
    }

    /// Gets the signal that terminated the process, if it was terminated by a signal
    fn signal(&self) -> Option<i32> {
        self.inner.status.signal()
    }

    /// Gets stderr
    pub fn error_output(&self) -> String {
        String::from_utf8_lossy(&self.inner.stderr).into()
    }

    /// Gets stdout
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.inner.stdout).into()
    }

    /// Gets all available output, useful for reporting or debugging
    pub fn output_report(&self) -> String {
        let stdout = self.output();
        let stderr = self.error_output();

        let mut res = String::with_capacity(stdout.len() + stderr.len() + 20);

        if !stdout.is_empty() {
            res += &format!("stdout:\n{stdout}\n");
        }

        if !stderr.is_empty() {
            if !res.is_empty() {
                res += "\n";
            }
            res += &format!("stderr:\n{stderr}\n");
        }

        res
    }

    /// Checks if the process exited successfully, otherwise produces an error
    pub fn check(&self) -> Result<(), Box<DependencyError>> {
        if self.success() {
            return Ok(());
        }

        Err(Box::new(DependencyError::ExecutionFailed {
            dependency: self.dependency,
            rendered_command: self.rendered_command.clone(),
            code: self.code(),
            signal: self.signal(),
            stdout: self.output(),
            stderr: self.error_output(),
            explanation: self.explain_exit(),
            output: match self.output_report() {
                s if !s.is_empty() => s,
                _ => "(no output collected)".into(),
            },
        }))
    }

    /// Checks if the process exited successfully and returns the output,
    /// otherwise produces an error with the output
    pub fn check_output(&self) -> Result<String, Box<DependencyError>> {
        self.check()?;
        Ok(self.output())
    }

    /// Produces a string explaining the exit status of the process
    pub fn explain_exit(&self) -> String {
        if let Some(code) = self.code() {
            format!("exited with status: {code}")
        } else if let Some(signal) = self.signal() {
            format!("terminated by signal: {signal}")
        } else {
            "exited with unknown status".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command() {
        Dependency::Echo
            .cmd()
            .with_arg("Hello, world")
            .run_and_check(&HostRunner)
            .unwrap();
        let output = Dependency::Echo
            .cmd()
            .with_arg("Hello, world")
            .output_and_check(&HostRunner);
        assert_eq!(output.unwrap(), "Hello, world\n");

        let rendered = Dependency::Echo
            .cmd()
            .with_arg("Hello, world")
            .render_command();
        assert_eq!(rendered, "echo 'Hello, world'");
    }

    #[test]
    fn test_dependency_name() {
        assert_eq!(Dependency::Lvcreate.name(), "lvcreate");
        assert_eq!(Dependency::Mke2fs.name(), "mke2fs");
        assert_eq!(Dependency::Chroot.cmd().render_command(), "chroot");
    }

    #[test]
    fn test_arg_and_args() {
        let arg = Dependency::Echo
            .cmd()
            .with_arg("Hello, world")
            .output(&HostRunner);
        let args = Dependency::Echo
            .cmd()
            .with_args(["Hello,", "world"])
            .output(&HostRunner);

        let arg_output = arg.unwrap().output();
        let args_output = args.unwrap().output();
        assert_eq!(arg_output, args_output);
        assert_eq!(arg_output, "Hello, world\n");
    }

    #[test]
    fn test_nonexistent_dep() {
        let output = Dependency::DoesNotExist.cmd().output(&HostRunner).unwrap_err();
        assert!(matches!(*output, DependencyError::NotFound { .. }));

        let error: SdkError = (*output).into();
        assert_eq!(
            error.kind(),
            &ErrorKind::Environment(EnvironmentError::MissingBinary {
                binary: "doesnotexist"
            })
        );
    }

    #[test]
    fn test_commandoutput() {
        let output = Dependency::Echo
            .cmd()
            .with_arg("Hello, world")
            .output(&HostRunner)
            .unwrap();
        assert!(output.success());
        assert_eq!(output.code(), Some(0));
        assert_eq!(output.signal(), None);
        assert_eq!(output.error_output(), "");
        assert_eq!(output.output_report(), "stdout:\nHello, world\n\n");
        assert_eq!(output.explain_exit(), "exited with status: 0");

        let output = Dependency::False.cmd().output(&HostRunner).unwrap();
        assert!(!output.success());
        assert_eq!(output.code(), Some(1));
        assert_eq!(output.output_report(), "");
        assert!(matches!(
            *output.check().unwrap_err(),
            DependencyError::ExecutionFailed { .. }
        ));
        assert_eq!(output.explain_exit(), "exited with status: 1");
    }

    #[test]
    fn test_from_parts_failure_converts_to_tool_error() {
        let cmd = Dependency::Lvcreate.cmd().with_args(["-s", "vg/chroot"]);
        let output = CommandOutput::from_parts(&cmd, 5, "", "Volume group not found\n");
        assert_eq!(output.code(), Some(5));

        let error = output.check().message("Failed to create snapshot").unwrap_err();
        assert_eq!(
            error.kind(),
            &ErrorKind::Tool(ToolError::CommandFailed {
                binary: "lvcreate",
                explanation: "exited with status: 5".into(),
            })
        );
        let debug = format!("{error:?}");
        assert!(debug.contains("lvcreate -s vg/chroot"), "{debug}");
        assert!(debug.contains("Volume group not found"), "{debug}");
    }
}
