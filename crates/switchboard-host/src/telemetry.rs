//! Structured telemetry initialisation for the host.
//!
//! The general log goes to stderr in the configured format. Records on the
//! plugin log target are split out into their own JSON file when
//! `plugin_log` is set, and kept out of the general log.

use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal};
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::OnceCell;
use switchboard::logger::PLUGIN_LOG_TARGET;
use switchboard_config::{Config, LogFormat};
use tracing::Level;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::{self, time::UtcTime};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Handle returned when telemetry has been initialised.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to parse the configured log filter expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// The plugin log file could not be opened.
    #[error("failed to open plugin log '{path}': {source}")]
    PluginLog {
        /// File that was opened.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Failed to install the tracing subscriber.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the global subscriber on first use.
///
/// Later calls return a fresh [`TelemetryHandle`] and leave the installed
/// subscriber alone, even when `config` differs.
///
/// # Errors
///
/// Returns [`TelemetryError`] when the filter is malformed, the plugin log
/// cannot be opened or another subscriber is already installed.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(config))
        .map(|_| TelemetryHandle)
}

/// Filter directives for the general log.
///
/// The plugin log target is switched off when it has a file of its own.
pub(crate) fn general_directives(config: &Config) -> String {
    let filter = config.log_filter();
    if config.plugin_log().is_none() {
        return filter.to_owned();
    }
    let muted = format!("{PLUGIN_LOG_TARGET}=off");
    if filter.trim().is_empty() {
        muted
    } else {
        format!("{filter},{muted}")
    }
}

fn install_subscriber(config: &Config) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(general_directives(config))
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;

    let mut layers = vec![general_layer(config.log_format(), filter)];
    if let Some(path) = config.plugin_log() {
        layers.push(plugin_log_layer(open_plugin_log(path)?));
    }

    let subscriber = tracing_subscriber::registry().with(layers);
    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}

fn general_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer {
    let ansi = io::stderr().is_terminal();
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_writer(io::stderr)
            .with_timer(UtcTime::rfc_3339())
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_ansi(ansi)
            .with_writer(io::stderr)
            .with_timer(UtcTime::rfc_3339())
            .with_filter(filter)
            .boxed(),
    }
}

fn plugin_log_layer(file: File) -> BoxedLayer {
    fmt::layer()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_timer(UtcTime::rfc_3339())
        .with_filter(Targets::new().with_target(PLUGIN_LOG_TARGET, Level::TRACE))
        .boxed()
}

fn open_plugin_log(path: &Utf8Path) -> Result<File, TelemetryError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| TelemetryError::PluginLog {
            path: path.to_path_buf(),
            source,
        })
}
