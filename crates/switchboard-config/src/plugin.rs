//! Per-plugin entries of the host configuration.

use std::convert::Infallible;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// One plugin the host starts.
///
/// ```toml
/// [[plugins]]
/// path = "/usr/libexec/switchboard/audit"
/// args = ["--verbose"]
/// events = ["post-created", "post-deleted"]
/// auto_encrypt = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    /// Executable to launch.
    pub path: Utf8PathBuf,
    /// Name used in logs and results; defaults to the executable's file stem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Extra command-line arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Events the plugin is registered for after it starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
    /// Run the channel over mutual TLS.
    #[serde(default)]
    pub auto_encrypt: bool,
}

impl PluginConfig {
    /// Creates an entry for `path` with no arguments or events.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            name: None,
            args: Vec::new(),
            events: Vec::new(),
            auto_encrypt: false,
        }
    }

    /// Returns the configured name or the executable's file stem.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or_else(|| self.path.file_stem())
            .unwrap_or_else(|| self.path.as_str())
    }
}

impl FromStr for PluginConfig {
    type Err = Infallible;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(path))
    }
}
