use std::{panic, process::ExitCode};

use anyhow::{Context, Error};
use clap::Parser;
use log::{debug, error, info, LevelFilter};

use cros_sdk::{
    cli::{Cli, Commands, SnapshotAction},
    config::SdkConfig,
    validation::{self, HostUser},
    Driver, MultiLogger, SessionLog,
};
use osutils::dependencies::HostRunner;
use sdk_api::error::{InternalError, SdkError, SdkResultExt};

fn run_command(args: &Cli) -> Result<(), SdkError> {
    info!("cros_sdk version: {}", cros_sdk::CROS_SDK_VERSION);

    let mut config = SdkConfig::load(args.config.as_deref())?;
    args.apply_overrides(&mut config);
    validation::preflight(&config)?;
    let user = HostUser::from_env(|name| std::env::var(name).ok())?;

    let res = panic::catch_unwind(move || {
        let runner = HostRunner;
        let driver = Driver::new(&runner, config, user);
        let res = match &args.command {
            Commands::Create {
                replace, nousepkg, ..
            } => driver.create(*replace, !nousepkg),
            Commands::Enter { nousepkg, command } => driver.enter(command, !nousepkg),
            Commands::Delete { force } => driver.delete(*force),
            Commands::Unmount => driver.unmount(),
            Commands::Snapshot { action } => match action {
                SnapshotAction::Create { name } => driver.snapshot_create(name),
                SnapshotAction::Restore { name } => driver.snapshot_restore(name),
                SnapshotAction::Delete { name } => driver.snapshot_delete(name),
                SnapshotAction::List => driver.snapshot_list().map(|snapshots| {
                    for snapshot in snapshots {
                        println!("{snapshot}");
                    }
                }),
            },
            Commands::Fstrim => driver.fstrim().map(|summary| println!("{summary}")),
            Commands::Version => driver.version().map(|report| {
                print!("{}", serde_yaml::to_string(&report).unwrap_or_default());
            }),
        };
        res.message(format!("Failed to execute '{}' command", args.command))
    });

    match res {
        Err(e) => Err(SdkError::new(InternalError::Panic(format!("{e:?}")))),
        Ok(r) => r,
    }
}

fn setup_logging(args: &Cli) -> Result<(), Error> {
    let mut multilogger = MultiLogger::new()
        // Add regular env_logger to output to stderr
        .with_logger(Box::new(
            env_logger::builder()
                .format_timestamp(None)
                .filter_level(args.verbosity)
                .build(),
        ));

    let mut session = None;
    if let Some(log_file) = &args.log_file {
        let log = SessionLog::new(log_file).with_max_level(LevelFilter::Debug);
        session = Some((log_file, log.session()));
        multilogger.add_logger(log.into_logger());
    }

    multilogger.init().context("Logger already registered")?;
    if let Some((log_file, id)) = session {
        debug!("Recording session {id} in '{}'", log_file.display());
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Cli::parse();

    if let Err(e) = setup_logging(&args) {
        eprintln!("Failed to initialize logging: {e:?}");
        return ExitCode::from(1);
    }

    if let Err(e) = run_command(&args) {
        error!("cros_sdk failed: {e:?}");
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}
