//! Host runtime for Switchboard plugins.
//!
//! The binary loads configuration, installs telemetry, starts every
//! configured plugin and then either triggers one event or runs a health
//! check. Results are printed to stdout as JSON. [`run`] takes its IO
//! streams as arguments so tests can capture them.
//!
//! Configuration flags lead the command line and are handed to the
//! `ortho_config` loader; the subcommand follows them.

use std::ffi::OsString;
use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use serde::Serialize;
use switchboard::events::{EventData, HealthReport};
use switchboard::host::StartReport;
use switchboard_config::ConfigError;
use thiserror::Error;
use tracing::info;

mod bootstrap;
mod cli;
mod config;
pub mod telemetry;

use cli::{Cli, Command, parse_event_arg};
use telemetry::TelemetryError;

const CLI_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::cli");

/// Errors that stop the host before it produces a result.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Telemetry could not be installed.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    /// A result could not be encoded.
    #[error("failed to encode output: {0}")]
    Serialise(#[from] serde_json::Error),
    /// Output could not be written.
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

/// Runs the host with the provided arguments and IO handles.
///
/// Help and version requests print to `stdout` and succeed. Usage errors
/// exit with clap's status code; every other failure exits with `1`.
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    let args: Vec<OsString> = args.into_iter().collect();
    let split = config::split_config_arguments(&args);
    let cli = match Cli::try_parse_from(&split.command_arguments) {
        Ok(cli) => cli,
        Err(error) => return report_usage(&error, stdout, stderr),
    };
    match execute(&cli, &split.config_arguments, stdout) {
        Ok(code) => code,
        Err(error) => {
            writeln!(stderr, "switchboard: {error}").ok();
            ExitCode::FAILURE
        }
    }
}

fn report_usage<W: Write, E: Write>(
    error: &clap::Error,
    stdout: &mut W,
    stderr: &mut E,
) -> ExitCode {
    let rendered = error.render();
    if error.use_stderr() {
        write!(stderr, "{rendered}").ok();
        ExitCode::from(u8::try_from(error.exit_code()).unwrap_or(2))
    } else {
        write!(stdout, "{rendered}").ok();
        ExitCode::SUCCESS
    }
}

fn execute<W: Write>(
    cli: &Cli,
    config_arguments: &[OsString],
    stdout: &mut W,
) -> Result<ExitCode, AppError> {
    let config = config::load(config_arguments)?;
    telemetry::initialise(&config)?;

    let host = bootstrap::host(&config);
    let report = host.start_all(&bootstrap::plugin_specs(&config));

    let code = match &cli.command {
        Command::Trigger { event, arguments } => {
            let data: EventData = arguments.iter().map(|arg| parse_event_arg(arg)).collect();
            let result = host.trigger(event, &data);
            info!(
                target: CLI_TARGET,
                event = %event,
                handled = result.handled,
                errors = result.errors.len(),
                "trigger complete"
            );
            write_json(stdout, &result)?;
            if result.errors.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Command::Check => {
            let health = host.health_check();
            let check = CheckReport::new(&report, health);
            write_json(stdout, &check)?;
            if check.failed.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    };
    host.shutdown();
    Ok(code)
}

fn write_json<W: Write, T: Serialize>(stdout: &mut W, value: &T) -> Result<(), AppError> {
    serde_json::to_writer_pretty(&mut *stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct FailedPlugin {
    plugin: String,
    error: String,
}

/// Printed by `switchboard check`.
#[derive(Debug, Serialize)]
struct CheckReport {
    started: Vec<String>,
    failed: Vec<FailedPlugin>,
    health: HealthReport,
}

impl CheckReport {
    fn new(report: &StartReport, health: HealthReport) -> Self {
        Self {
            started: report.started.clone(),
            failed: report
                .failed
                .iter()
                .map(|failure| FailedPlugin {
                    plugin: failure.plugin.clone(),
                    error: failure.error.to_string(),
                })
                .collect(),
            health,
        }
    }
}

#[cfg(test)]
mod tests;
