//! Separates configuration flags from the command line.
//!
//! Leading flags listed in [`CONFIG_CLI_FLAGS`] go to the `ortho_config`
//! loader together with the program name. Everything from the first other
//! token onwards is the subcommand and its arguments.

use std::ffi::{OsStr, OsString};

use switchboard_config::{Config, ConfigError};

/// Flags the configuration loader understands, in `--flag VALUE` or
/// `--flag=VALUE` form.
pub(crate) const CONFIG_CLI_FLAGS: &[&str] = &[
    "--config-path",
    "--log-filter",
    "--log-format",
    "--plugin-log",
    "--cookie-key",
    "--cookie-value",
    "--protocol-version",
    "--startup-timeout-ms",
    "--call-timeout-ms",
    "--max-concurrency",
    "--plugins",
];

/// Help text appended to `--help`.
pub(crate) const CONFIG_HELP: &str = "\
Configuration flags (must precede the command):
  --config-path <PATH>          Configuration file to load
  --log-filter <FILTER>         Log filter directive
  --log-format <FORMAT>         `json` or `compact`
  --plugin-log <PATH>           File receiving plugin output and RPC records
  --cookie-key <NAME>           Environment variable carrying the cookie
  --cookie-value <VALUE>        Handshake cookie value
  --protocol-version <N>        Application protocol version
  --startup-timeout-ms <MS>     Handshake budget per plugin
  --call-timeout-ms <MS>        Budget per remote call
  --max-concurrency <N>         Concurrent trigger calls
  --plugins <PATH>              Start a plugin executable (repeatable)

Every setting can also come from the file or a SWITCHBOARD_* variable.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagAction {
    Include { needs_value: bool },
    Stop,
}

fn classify(argument: &OsStr) -> FlagAction {
    let Some(text) = argument.to_str() else {
        return FlagAction::Stop;
    };
    let (flag, inline_value) = match text.split_once('=') {
        Some((flag, _)) => (flag, true),
        None => (text, false),
    };
    if CONFIG_CLI_FLAGS.contains(&flag) {
        FlagAction::Include {
            needs_value: !inline_value,
        }
    } else {
        FlagAction::Stop
    }
}

/// Arguments for the configuration loader and for the command parser.
/// Both start with the program name.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ConfigArgumentSplit {
    pub(crate) config_arguments: Vec<OsString>,
    pub(crate) command_arguments: Vec<OsString>,
}

pub(crate) fn split_config_arguments(args: &[OsString]) -> ConfigArgumentSplit {
    let Some((program, rest)) = args.split_first() else {
        return ConfigArgumentSplit::default();
    };

    let mut config_arguments = vec![program.clone()];
    let mut command_start = rest.len();
    let mut pending_value = false;
    for (index, argument) in rest.iter().enumerate() {
        if pending_value {
            config_arguments.push(argument.clone());
            pending_value = false;
            continue;
        }
        match classify(argument) {
            FlagAction::Include { needs_value } => {
                config_arguments.push(argument.clone());
                pending_value = needs_value;
            }
            FlagAction::Stop => {
                command_start = index;
                break;
            }
        }
    }

    let command = rest.get(command_start..).unwrap_or_default();
    ConfigArgumentSplit {
        config_arguments,
        command_arguments: std::iter::once(program.clone())
            .chain(command.iter().cloned())
            .collect(),
    }
}

/// Loads and validates configuration from the leading flags, the
/// environment and the configuration file.
pub(crate) fn load(config_arguments: &[OsString]) -> Result<Config, ConfigError> {
    Config::load_validated(config_arguments.iter().cloned())
}
