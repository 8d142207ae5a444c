//! Trust contract negotiated before a plugin connection is used.
//!
//! The host exports the expected cookie and the protocol versions it accepts
//! through the child's environment. The plugin checks the cookie, picks a
//! protocol version, binds its endpoint, and answers with a single JSON
//! [`HandshakeLine`] on stdout. The host validates that line with
//! [`HandshakeExpectation`] before it connects to the announced endpoint.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::Endpoint;

/// Version of the framing and JSON-RPC layer shared by host and plugins.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Application protocol version spoken by the `eventplugin` capability.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the cookie value by default.
pub const DEFAULT_COOKIE_KEY: &str = "SWITCHBOARD_RPC_COOKIE";

/// Cookie value the default host and plugins agree on.
pub const DEFAULT_COOKIE_VALUE: &str = "switchboard-rpc";

/// Environment variable listing the protocol versions the host accepts.
pub const PROTOCOL_VERSIONS_ENV: &str = "SWITCHBOARD_PLUGIN_PROTOCOL_VERSIONS";

/// Environment variable carrying the host's per-session client certificate.
pub const CLIENT_CERT_ENV: &str = "SWITCHBOARD_PLUGIN_CLIENT_CERT";

/// Shared secret and version tuple both binaries are built with.
///
/// # Example
///
/// ```
/// use switchboard::handshake::HandshakeConfig;
///
/// let config = HandshakeConfig::new(1, "MY_APP_PLUGIN", "hello");
/// assert_eq!(config.cookie_key(), "MY_APP_PLUGIN");
/// let env = config.child_environment();
/// assert!(env.contains(&("MY_APP_PLUGIN".to_owned(), "hello".to_owned())));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    protocol_version: u32,
    cookie_key: String,
    cookie_value: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self::new(
            DEFAULT_PROTOCOL_VERSION,
            DEFAULT_COOKIE_KEY,
            DEFAULT_COOKIE_VALUE,
        )
    }
}

impl HandshakeConfig {
    /// Creates a handshake configuration.
    #[must_use]
    pub fn new(
        protocol_version: u32,
        cookie_key: impl Into<String>,
        cookie_value: impl Into<String>,
    ) -> Self {
        Self {
            protocol_version,
            cookie_key: cookie_key.into(),
            cookie_value: cookie_value.into(),
        }
    }

    /// Returns the protocol version the host accepts.
    #[must_use]
    pub const fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Returns the name of the environment variable carrying the cookie.
    #[must_use]
    pub const fn cookie_key(&self) -> &str {
        self.cookie_key.as_str()
    }

    /// Returns the expected cookie value.
    #[must_use]
    pub const fn cookie_value(&self) -> &str {
        self.cookie_value.as_str()
    }

    /// Environment entries the host exports to a plugin child.
    #[must_use]
    pub fn child_environment(&self) -> Vec<(String, String)> {
        vec![
            (self.cookie_key.clone(), self.cookie_value.clone()),
            (
                PROTOCOL_VERSIONS_ENV.to_owned(),
                self.protocol_version.to_string(),
            ),
        ]
    }

    /// Verifies the cookie the host placed in the plugin's environment.
    ///
    /// `lookup` abstracts environment access so the check can be exercised
    /// without mutating the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::MissingCookie`] when the variable is unset
    /// and [`HandshakeError::CookieValueMismatch`] when it differs.
    pub fn check_cookie<F>(&self, lookup: F) -> Result<(), HandshakeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(&self.cookie_key) {
            None => Err(HandshakeError::MissingCookie {
                key: self.cookie_key.clone(),
            }),
            Some(value) if value == self.cookie_value => Ok(()),
            Some(_) => Err(HandshakeError::CookieValueMismatch {
                key: self.cookie_key.clone(),
            }),
        }
    }
}

/// Parses the comma-separated version list exported by the host.
///
/// # Errors
///
/// Returns [`HandshakeError::Malformed`] when an entry is not an integer.
pub fn parse_version_list(raw: &str) -> Result<Vec<u32>, HandshakeError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry.parse::<u32>().map_err(|err| HandshakeError::Malformed {
                message: format!("invalid protocol version '{entry}': {err}"),
            })
        })
        .collect()
}

/// Picks the highest version both the host and the plugin understand.
#[must_use]
pub fn negotiate_version(host_accepts: &[u32], plugin_supports: &[u32]) -> Option<u32> {
    plugin_supports
        .iter()
        .copied()
        .filter(|version| host_accepts.contains(version))
        .max()
}

/// The single line a plugin writes to stdout once it is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeLine {
    /// Framing layer version.
    pub core_version: u32,
    /// Negotiated application protocol version.
    pub protocol_version: u32,
    /// Echo of the cookie variable name.
    pub cookie_key: String,
    /// Echo of the cookie value.
    pub cookie_value: String,
    /// Endpoint the plugin listens on, as `unix://` or `tcp://` text.
    pub endpoint: String,
    /// Capability names the plugin serves.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Base64 DER certificate when the session is encrypted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_cert: Option<String>,
}

impl HandshakeLine {
    /// Serialises the line without a trailing newline.
    ///
    /// # Errors
    ///
    /// Returns the JSON error when serialisation fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a line read from the plugin's stdout.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Malformed`] when the line is not a valid
    /// handshake record.
    pub fn parse(line: &str) -> Result<Self, HandshakeError> {
        serde_json::from_str(line.trim()).map_err(|err| HandshakeError::Malformed {
            message: format!("{err} in '{}'", truncate_for_log(line.trim(), 120)),
        })
    }

    /// Parses the announced endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::InvalidEndpoint`] when the text does not
    /// describe a supported endpoint.
    pub fn endpoint(&self) -> Result<Endpoint, HandshakeError> {
        self.endpoint
            .parse::<Endpoint>()
            .map_err(|err| HandshakeError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                message: err.to_string(),
            })
    }
}

/// Host-side rules a [`HandshakeLine`] must satisfy.
#[derive(Debug, Clone)]
pub struct HandshakeExpectation<'a> {
    config: &'a HandshakeConfig,
    require_encryption: bool,
}

impl<'a> HandshakeExpectation<'a> {
    /// Creates an expectation for the given configuration.
    #[must_use]
    pub const fn new(config: &'a HandshakeConfig, require_encryption: bool) -> Self {
        Self {
            config,
            require_encryption,
        }
    }

    /// Validates a parsed line.
    ///
    /// # Errors
    ///
    /// Returns the first mismatch found, checked in the order core version,
    /// protocol version, cookie key, cookie value, encryption material.
    pub fn validate(&self, line: &HandshakeLine) -> Result<(), HandshakeError> {
        if line.core_version != CORE_PROTOCOL_VERSION {
            return Err(HandshakeError::CoreVersion {
                expected: CORE_PROTOCOL_VERSION,
                actual: line.core_version,
            });
        }
        if line.protocol_version != self.config.protocol_version() {
            return Err(HandshakeError::UnsupportedVersion {
                version: line.protocol_version,
                accepted: self.config.protocol_version().to_string(),
            });
        }
        if line.cookie_key != self.config.cookie_key() {
            return Err(HandshakeError::CookieKeyMismatch {
                expected: self.config.cookie_key().to_owned(),
                actual: line.cookie_key.clone(),
            });
        }
        if line.cookie_value != self.config.cookie_value() {
            return Err(HandshakeError::CookieValueMismatch {
                key: line.cookie_key.clone(),
            });
        }
        if self.require_encryption && line.server_cert.is_none() {
            return Err(HandshakeError::EncryptionRequired);
        }
        Ok(())
    }
}

/// Reasons a handshake is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The plugin closed stdout before writing its handshake line.
    #[error("plugin exited before completing the handshake{}", describe_status(*status))]
    Closed {
        /// Exit status when the process had already terminated.
        status: Option<i32>,
    },
    /// The handshake line did not arrive in time.
    #[error("no handshake received within {timeout_ms}ms")]
    Timeout {
        /// Startup budget in milliseconds.
        timeout_ms: u64,
    },
    /// The handshake line could not be parsed.
    #[error("malformed handshake: {message}")]
    Malformed {
        /// Parse failure description.
        message: String,
    },
    /// The plugin speaks another framing layer version.
    #[error("core protocol version mismatch: expected {expected}, got {actual}")]
    CoreVersion {
        /// Host core version.
        expected: u32,
        /// Plugin core version.
        actual: u32,
    },
    /// The plugin picked a protocol version the host does not accept.
    #[error("unsupported protocol version {version} (host accepts {accepted})")]
    UnsupportedVersion {
        /// Version announced by the plugin.
        version: u32,
        /// Versions the host accepts.
        accepted: String,
    },
    /// No protocol version is shared between host and plugin.
    #[error("no common protocol version: host offers {offered}, plugin supports {supported}")]
    NoCommonVersion {
        /// Versions exported by the host.
        offered: String,
        /// Versions compiled into the plugin.
        supported: String,
    },
    /// The echoed cookie key differs from the expected one.
    #[error("cookie key mismatch: expected '{expected}', got '{actual}'")]
    CookieKeyMismatch {
        /// Expected cookie variable name.
        expected: String,
        /// Echoed cookie variable name.
        actual: String,
    },
    /// The echoed cookie value differs from the expected one.
    #[error("cookie value mismatch for '{key}'")]
    CookieValueMismatch {
        /// Cookie variable name.
        key: String,
    },
    /// The plugin was started without the cookie.
    #[error("cookie '{key}' is not set; this binary is a plugin and is not meant to be run directly")]
    MissingCookie {
        /// Cookie variable name.
        key: String,
    },
    /// Encryption was required but the plugin offered no certificate.
    #[error("encrypted transport required but the plugin offered no certificate")]
    EncryptionRequired,
    /// The announced endpoint could not be parsed.
    #[error("invalid endpoint '{endpoint}': {message}")]
    InvalidEndpoint {
        /// Endpoint text from the handshake.
        endpoint: String,
        /// Parse failure description.
        message: String,
    },
}

fn describe_status(status: Option<i32>) -> String {
    status
        .map(|code| format!(" (exit status {code})"))
        .unwrap_or_default()
}

fn truncate_for_log(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
