//! Command-line front end for the warden sandbox.
//!
//! [`run`] loads [`warden_config::Config`] from the leading configuration
//! flags, installs tracing through [`telemetry`], parses the subcommand and
//! either prints the syscall table or runs a binary under a policy built
//! from the `run` flags. Output goes to the writers the caller passes in.

use std::ffi::OsString;
use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;

mod cli;
mod command;
mod config;
mod errors;
pub mod telemetry;

use cli::{Cli, CliCommand};
pub use command::{
    EXIT_KILLED, EXIT_SETUP, EXIT_SIGNAL_BASE, EXIT_TIMEOUT, EXIT_VIOLATION, exit_status,
};
use config::{ConfigLoader, OrthoConfigLoader, split_config_arguments};
pub(crate) use errors::AppError;

/// Exit status for malformed command lines.
pub const EXIT_USAGE: u8 = 2;

/// Runs the CLI with `args` (program name first).
#[must_use]
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    run_with_loader(args, stdout, stderr, &OrthoConfigLoader)
}

pub(crate) fn run_with_loader<I, W, E, L>(
    args: I,
    stdout: &mut W,
    stderr: &mut E,
    loader: &L,
) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
    L: ConfigLoader,
{
    let split = split_config_arguments(args.into_iter().collect());

    let cli = match Cli::try_parse_from(split.command_arguments) {
        Ok(cli) => cli,
        Err(error) => return report_usage(&error, stdout, stderr),
    };

    match dispatch(&cli, &split.config_arguments, loader, stdout, stderr) {
        Ok(status) => ExitCode::from(status),
        Err(error) => {
            emit(writeln!(stderr, "warden: {error}"));
            ExitCode::FAILURE
        }
    }
}

fn dispatch<W, E, L>(
    cli: &Cli,
    config_arguments: &[OsString],
    loader: &L,
    stdout: &mut W,
    stderr: &mut E,
) -> Result<u8, AppError>
where
    W: Write,
    E: Write,
    L: ConfigLoader,
{
    let config = loader.load(config_arguments)?;
    telemetry::initialise(&config)?;
    match &cli.command {
        CliCommand::Run(args) => command::execute_run(args, &config, stdout, stderr),
        CliCommand::Syscalls { query } => command::execute_syscalls(query.as_deref(), stdout),
    }
}

fn report_usage<W: Write, E: Write>(
    error: &clap::Error,
    stdout: &mut W,
    stderr: &mut E,
) -> ExitCode {
    let rendered = error.render().to_string();
    match error.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            emit(write!(stdout, "{rendered}"));
            ExitCode::SUCCESS
        }
        _ => {
            emit(write!(stderr, "{rendered}"));
            ExitCode::from(EXIT_USAGE)
        }
    }
}

/// Failures here have no stream left to be reported on.
fn emit(result: io::Result<()>) {
    if let Err(error) = result {
        tracing::warn!(target: "warden_cli", %error, "failed to write CLI output");
    }
}
