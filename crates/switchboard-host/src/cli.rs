//! Command-line interface definitions for the host.

use clap::{Parser, Subcommand};
use switchboard::EventValue;

use crate::config::CONFIG_HELP;

/// Starts Switchboard plugins and sends them events.
#[derive(Parser, Debug)]
#[command(
    name = "switchboard",
    version,
    disable_help_subcommand = true,
    after_help = CONFIG_HELP
)]
pub(crate) struct Cli {
    /// What to do once the plugins are running.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Host actions.
#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Triggers one event on every plugin and prints the merged result.
    Trigger {
        /// Event name, for example `post-created`.
        #[arg(value_name = "EVENT")]
        event: String,
        /// Positional event arguments. `null`, `true`, `false`, integers and
        /// floats are typed; anything else is sent as a string.
        #[arg(
            value_name = "ARG",
            num_args = 0..,
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        arguments: Vec<String>,
    },
    /// Starts every plugin, runs a health check and prints a report.
    Check,
}

/// Interprets one command-line argument as an event value.
///
/// Spellings such as `NaN` or `inf` stay strings; programmatic callers can
/// still send non-finite floats.
pub(crate) fn parse_event_arg(text: &str) -> EventValue {
    match text {
        "null" => EventValue::Null,
        "true" => EventValue::Bool(true),
        "false" => EventValue::Bool(false),
        _ => text
            .parse::<i64>()
            .map(EventValue::Int)
            .ok()
            .or_else(|| {
                text.parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite())
                    .map(EventValue::Float)
            })
            .unwrap_or_else(|| EventValue::String(text.to_owned())),
    }
}
