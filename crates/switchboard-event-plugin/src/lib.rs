//! Reference `eventplugin` for Switchboard.
//!
//! The plugin logs every `register` and `trigger` call, and each trigger
//! argument, through `tracing`. What it then answers is chosen with
//! `--behaviour` so the host's containment paths can be driven from real
//! processes. The host's `rpc-init` trigger is always acknowledged without
//! applying the behaviour, so a plugin that misbehaves still starts.

use std::ffi::OsString;
use std::io::Write;
use std::process::{self, ExitCode};
use std::sync::Mutex;
use std::thread;

use clap::Parser;
use strum::{Display, EnumString};
use switchboard::events::{EventData, EventHandler, RPC_INIT_EVENT, TriggerOutcome};
use switchboard::handshake::HandshakeConfig;
use switchboard::serve::{ServeConfig, ServeError, serve};
use tracing::{error, info};

const HANDLER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::handler");

/// Name the plugin serves under.
pub const PLUGIN_NAME: &str = "switchboard-event-plugin";

/// Status the `exit` behaviour terminates with mid-call.
pub const EXIT_MID_CALL: i32 = 3;

/// Printed when the binary is run without a host.
pub const NOT_A_HOST_MESSAGE: &str = "This binary is a Switchboard plugin. It is not meant to \
     be executed directly. Run the switchboard host, which starts its plugins automatically.";

/// How the plugin answers triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Behaviour {
    /// Logs the call and leaves the event unhandled.
    #[default]
    Log,
    /// Marks every event handled.
    Handled,
    /// Panics inside the handler.
    Panic,
    /// Handles the event and replies with its arguments.
    Echo,
    /// Reports an application error.
    Fail,
    /// Never answers.
    Hang,
    /// Exits the process while the call is in flight.
    Exit,
    /// Expects a cookie the host never sends.
    WrongCookie,
}

/// Command line of the reference plugin.
#[derive(Parser, Debug)]
#[command(name = "switchboard-event-plugin", version)]
pub struct PluginArgs {
    /// How to answer triggers.
    #[arg(long, default_value_t = Behaviour::Log)]
    pub behaviour: Behaviour,
    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}

/// Event handler driven by a [`Behaviour`].
#[derive(Debug, Default)]
pub struct ReferencePlugin {
    behaviour: Behaviour,
    registered: Mutex<Vec<String>>,
}

impl ReferencePlugin {
    /// Creates a handler with `behaviour`.
    #[must_use]
    pub const fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            registered: Mutex::new(Vec::new()),
        }
    }

    /// Events the host registered this plugin for.
    #[must_use]
    pub fn registered(&self) -> Vec<String> {
        self.registered
            .lock()
            .map(|triggers| triggers.clone())
            .unwrap_or_default()
    }

    fn log_arguments(event: &str, args: &EventData) {
        info!(target: HANDLER_TARGET, trigger = event, args = args.len(), "trigger called");
        for (id, value) in args.iter().enumerate() {
            info!(target: HANDLER_TARGET, id, value = ?value, "element in args");
        }
    }
}

impl EventHandler for ReferencePlugin {
    fn register(&self, triggers: &[String]) {
        info!(target: HANDLER_TARGET, triggers = ?triggers, "register called");
        if let Ok(mut registered) = self.registered.lock() {
            *registered = triggers.to_vec();
        }
    }

    fn trigger(&self, event: &str, args: &EventData) -> TriggerOutcome {
        Self::log_arguments(event, args);
        if event == RPC_INIT_EVENT {
            return TriggerOutcome::handled();
        }
        match self.behaviour {
            Behaviour::Log | Behaviour::WrongCookie => TriggerOutcome::ignored(),
            Behaviour::Handled => TriggerOutcome::handled(),
            Behaviour::Echo => TriggerOutcome::handled().with_reply(args.clone()),
            Behaviour::Fail => TriggerOutcome::failed(format!("refused to handle {event}")),
            Behaviour::Panic => refuse(event),
            Behaviour::Hang => hang(),
            Behaviour::Exit => {
                error!(target: HANDLER_TARGET, trigger = event, "exiting mid-call");
                process::exit(EXIT_MID_CALL)
            }
        }
    }
}

fn refuse(event: &str) -> TriggerOutcome {
    panic!("reference plugin refuses {event}")
}

fn hang() -> TriggerOutcome {
    loop {
        thread::park();
    }
}

/// Serve configuration for `behaviour`.
#[must_use]
pub fn serve_config(behaviour: Behaviour) -> ServeConfig {
    let config = ServeConfig::events(PLUGIN_NAME, ReferencePlugin::new(behaviour));
    if behaviour == Behaviour::WrongCookie {
        let expected = HandshakeConfig::default();
        config.with_handshake(HandshakeConfig::new(
            expected.protocol_version(),
            expected.cookie_key(),
            "not-the-host-cookie",
        ))
    } else {
        config
    }
}

/// Runs the plugin until the host disconnects.
///
/// A missing or wrong cookie means the binary was not started by a host:
/// a notice goes to `stderr` and the exit status is `1`.
pub fn run<I, E>(args: I, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    E: Write,
{
    let parsed = match PluginArgs::try_parse_from(args) {
        Ok(parsed) => parsed,
        Err(usage) => {
            write!(stderr, "{}", usage.render()).ok();
            return ExitCode::from(2);
        }
    };
    switchboard::serve::init_logging(&parsed.log_filter);
    info!(target: HANDLER_TARGET, behaviour = %parsed.behaviour, "hello from the reference plugin");
    match serve(serve_config(parsed.behaviour)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report(&err, stderr),
    }
}

fn report<E: Write>(err: &ServeError, stderr: &mut E) -> ExitCode {
    if err.is_cookie_failure() {
        writeln!(stderr, "{NOT_A_HOST_MESSAGE}").ok();
    } else {
        writeln!(stderr, "{PLUGIN_NAME}: {err}").ok();
    }
    ExitCode::FAILURE
}

#[cfg(test)]
mod tests;
