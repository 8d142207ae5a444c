//! Configuration for the Switchboard host.
//!
//! [`Config`] derives `OrthoConfig`, so settings are layered as built-in
//! defaults, then a TOML file (`--config-path` or `SWITCHBOARD_CONFIG_PATH`,
//! else the loader's discovery paths), then `SWITCHBOARD_*` environment
//! variables, then command-line flags. [`Config::load_validated`] adds range
//! checks on top.
//!
//! ```toml
//! log_filter = "switchboard=debug"
//! plugin_log = "/var/log/switchboard/plugins.log"
//! call_timeout_ms = 2000
//!
//! [[plugins]]
//! path = "/usr/libexec/switchboard/audit"
//! events = ["post-created"]
//! ```

mod defaults;
mod logging;
mod plugin;

use std::collections::HashSet;
use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::defaults::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_COOKIE_KEY, DEFAULT_COOKIE_VALUE, DEFAULT_LOG_FILTER,
    DEFAULT_MAX_CONCURRENCY, DEFAULT_PROTOCOL_VERSION, DEFAULT_STARTUP_TIMEOUT,
    default_log_filter, default_log_filter_string, default_log_format,
};
pub use self::logging::{LogFormat, LogFormatParseError};
pub use self::plugin::PluginConfig;

/// Names the configuration file to load.
pub const CONFIG_PATH_ENV: &str = "SWITCHBOARD_CONFIG_PATH";

/// Overrides `log_filter`.
pub const LOG_FILTER_ENV: &str = "SWITCHBOARD_LOG_FILTER";

/// Overrides `log_format`.
pub const LOG_FORMAT_ENV: &str = "SWITCHBOARD_LOG_FORMAT";

/// Overrides `plugin_log`. An empty value disables the plugin log.
pub const PLUGIN_LOG_ENV: &str = "SWITCHBOARD_PLUGIN_LOG";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A layer could not be read, parsed or merged.
    #[error("failed to load configuration: {0}")]
    Load(Arc<OrthoError>),

    /// A setting is out of range.
    #[error("invalid configuration: {message}")]
    Invalid {
        /// Description of the problem.
        message: String,
    },
}

/// Host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "SWITCHBOARD")]
#[serde(default)]
pub struct Config {
    /// `tracing` filter directive for host diagnostics.
    pub log_filter: String,
    /// Output format for host diagnostics.
    pub log_format: LogFormat,
    /// File receiving plugin output and plugin RPC records. When unset,
    /// plugin records go to the general log.
    pub plugin_log: Option<Utf8PathBuf>,
    /// Environment variable carrying the handshake cookie.
    pub cookie_key: String,
    /// Handshake cookie value.
    pub cookie_value: String,
    /// Application protocol version.
    pub protocol_version: u32,
    /// Budget for a plugin's handshake line, in milliseconds.
    pub startup_timeout_ms: u64,
    /// Budget for each remote call, in milliseconds.
    pub call_timeout_ms: u64,
    /// Upper bound on concurrent trigger calls.
    pub max_concurrency: usize,
    /// Only trigger plugins that registered for the event.
    pub filter_by_registration: bool,
    /// Plugins to start, in order. `--plugins <PATH>` adds one by path.
    pub plugins: Vec<PluginConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            plugin_log: None,
            cookie_key: DEFAULT_COOKIE_KEY.to_owned(),
            cookie_value: DEFAULT_COOKIE_VALUE.to_owned(),
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            startup_timeout_ms: millis(DEFAULT_STARTUP_TIMEOUT),
            call_timeout_ms: millis(DEFAULT_CALL_TIMEOUT),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            filter_by_registration: false,
            plugins: Vec::new(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Loads every layer from `args` and the process environment, then
    /// validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] when a layer cannot be read or merged
    /// and [`ConfigError::Invalid`] when validation fails.
    pub fn load_validated<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let config = Self::load_from_iter(args).map_err(ConfigError::Load)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Returns the log format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Returns the plugin log file, treating an empty path as unset.
    #[must_use]
    pub fn plugin_log(&self) -> Option<&Utf8Path> {
        self.plugin_log
            .as_deref()
            .filter(|path| !path.as_str().trim().is_empty())
    }

    /// Returns the startup budget.
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Returns the per-call budget.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Checks ranges and required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid { message });
        if self.cookie_key.trim().is_empty() {
            return invalid("cookie_key must not be empty".to_owned());
        }
        if self.cookie_value.is_empty() {
            return invalid("cookie_value must not be empty".to_owned());
        }
        if self.startup_timeout_ms == 0 {
            return invalid("startup_timeout_ms must be greater than zero".to_owned());
        }
        if self.call_timeout_ms == 0 {
            return invalid("call_timeout_ms must be greater than zero".to_owned());
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be greater than zero".to_owned());
        }
        let mut names = HashSet::new();
        for (index, plugin) in self.plugins.iter().enumerate() {
            if plugin.path.as_str().trim().is_empty() {
                return invalid(format!("plugins[{index}].path must not be empty"));
            }
            if !names.insert(plugin.display_name()) {
                return invalid(format!(
                    "plugins[{index}] reuses the name '{}'",
                    plugin.display_name()
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
