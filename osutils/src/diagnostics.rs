use std::path::Path;

use log::debug;

use crate::dependencies::{Command, CommandRunner, Dependency};

/// Collects who is keeping `path` busy, for inclusion in an unmount failure.
///
/// Runs `fuser`, `lsof` and `ps auxf` and concatenates their output verbatim. Each tool is
/// best effort: a missing or failing tool is noted in the report rather than returned.
pub fn busy_report(runner: &dyn CommandRunner, path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    let commands = [
        Dependency::Fuser.cmd().with_args(["-vm"]).with_arg(path),
        Dependency::Lsof.cmd().with_arg("+D").with_arg(path),
        Dependency::Ps.cmd().with_arg("auxf"),
    ];

    commands
        .iter()
        .map(|command| section(runner, command))
        .collect::<Vec<_>>()
        .join("\n")
}

fn section(runner: &dyn CommandRunner, command: &Command) -> String {
    let rendered = command.render_command();
    // fuser and lsof exit non-zero when nothing holds the path, so the exit code is ignored.
    let body = match command.output(runner) {
        Ok(output) => match output.output_report() {
            report if report.is_empty() => "(no output collected)\n".to_string(),
            report => report,
        },
        Err(e) => {
            debug!("Diagnostic command '{rendered}' could not run: {e}");
            format!("(could not run: {e})\n")
        }
    };
    format!("$ {rendered}\n{body}")
}
