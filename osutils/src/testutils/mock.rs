use std::{
    cell::RefCell, collections::VecDeque, io, os::unix::process::ExitStatusExt,
    process::ExitStatus,
};

use crate::dependencies::{Command, CommandOutput, CommandRunner, Dependency, DependencyError};

/// What a scripted expectation matches on. `None` fields match anything.
pub struct MockCommandInput {
    pub dependency: Dependency,
    pub args: Option<Vec<String>>,
}

impl MockCommandInput {
    pub fn new(dependency: Dependency, args: &[&str]) -> Self {
        Self {
            dependency,
            args: Some(args.iter().map(|&s| s.into()).collect()),
        }
    }

    /// Matches any invocation of `dependency`.
    pub fn any(dependency: Dependency) -> Self {
        Self {
            dependency,
            args: None,
        }
    }
}

pub struct MockCommandOutput {
    result: Result<(i32, String, String), Dependency>,
}

impl MockCommandOutput {
    pub fn new(exit_status: i32, out: &str, err: &str) -> Self {
        Self {
            result: Ok((exit_status, out.to_owned(), err.to_owned())),
        }
    }

    /// The binary could not be started at all.
    pub fn unavailable(dependency: Dependency) -> Self {
        Self {
            result: Err(dependency),
        }
    }
}

/// A runner that replays a fixed script of expectations in order and panics on anything else.
/// Every expectation must be consumed before the runner is dropped.
#[derive(Default)]
pub struct MockCommandRunner {
    expectations: RefCell<VecDeque<(MockCommandInput, MockCommandOutput)>>,
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_expectation(&self, input: MockCommandInput, output: MockCommandOutput) {
        self.expectations.borrow_mut().push_back((input, output));
    }

    pub fn expect_success(&self, dependency: Dependency, args: &[&str]) {
        self.add_expectation(
            MockCommandInput::new(dependency, args),
            MockCommandOutput::new(0, "", ""),
        );
    }

    fn next(&self, command: &Command) -> Result<(i32, String, String), Box<DependencyError>> {
        let (input, output) = self
            .expectations
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| panic!("Unexpected command '{}'", command.render_command()));

        assert_eq!(
            command.dependency(),
            input.dependency,
            "Unexpected command '{}'",
            command.render_command()
        );
        if let Some(args) = input.args {
            assert_eq!(command.arg_strings(), args);
        }

        output.result.map_err(|dependency| {
            Box::new(DependencyError::CouldNotExecute {
                dependency,
                inner: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
            })
        })
    }
}

impl CommandRunner for MockCommandRunner {
    fn execute(&self, command: &Command) -> Result<CommandOutput, Box<DependencyError>> {
        let (code, out, err) = self.next(command)?;
        Ok(CommandOutput::from_parts(command, code, &out, &err))
    }

    fn execute_interactive(&self, command: &Command) -> Result<ExitStatus, Box<DependencyError>> {
        let (code, _, _) = self.next(command)?;
        Ok(ExitStatus::from_raw(code << 8))
    }
}

impl Drop for MockCommandRunner {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            let remaining = self.expectations.get_mut();
            assert!(
                remaining.is_empty(),
                "{} expected command(s) were never run, next: {:?} {:?}",
                remaining.len(),
                remaining.front().map(|(input, _)| input.dependency),
                remaining.front().and_then(|(input, _)| input.args.clone()),
            );
        }
    }
}
