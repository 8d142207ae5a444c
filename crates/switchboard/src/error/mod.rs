//! Errors raised while starting, looking up and dispensing from plugins.
//!
//! Each variant names the plugin it concerns. Handshake, TLS and call
//! failures keep their cause as the error source; I/O causes are held in an
//! `Arc`.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::handshake::HandshakeError;
use crate::transport::{CallError, TlsError};

/// Errors arising from plugin startup, capability negotiation, and lookup.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The configured plugin description is unusable.
    #[error("invalid plugin spec: {message}")]
    InvalidSpec {
        /// Description of the validation failure.
        message: String,
    },

    /// The plugin executable was not found on the filesystem.
    #[error("plugin '{name}' executable not found: {}", path.display())]
    ExecutableNotFound {
        /// Plugin name.
        name: String,
        /// Path that was checked.
        path: PathBuf,
    },

    /// The plugin process could not be spawned.
    #[error("plugin '{name}' failed to start: {message}")]
    SpawnFailed {
        /// Plugin name.
        name: String,
        /// Human-readable failure description.
        message: String,
        /// Optional underlying I/O error.
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    /// The plugin did not prove it speaks the expected protocol.
    #[error("plugin '{name}' failed the handshake: {source}")]
    Handshake {
        /// Plugin name.
        name: String,
        /// Reason the handshake was rejected.
        #[source]
        source: HandshakeError,
    },

    /// The host could not reach the endpoint announced by the plugin.
    #[error("plugin '{name}' endpoint {endpoint} is unreachable: {source}")]
    Connect {
        /// Plugin name.
        name: String,
        /// Endpoint announced in the handshake.
        endpoint: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The encrypted session could not be established.
    #[error("plugin '{name}' TLS session failed: {source}")]
    Tls {
        /// Plugin name.
        name: String,
        /// Underlying TLS failure.
        #[source]
        source: TlsError,
    },

    /// The peer does not serve the requested capability.
    #[error("plugin '{name}' does not export capability '{capability}'")]
    CapabilityNotExported {
        /// Plugin name.
        name: String,
        /// Capability that was requested.
        capability: String,
    },

    /// A call to the plugin failed at the transport or remote level.
    #[error("call to plugin '{name}' failed: {source}")]
    Call {
        /// Plugin name.
        name: String,
        /// Underlying call failure.
        #[source]
        source: CallError,
    },

    /// The requested plugin is not part of the live registry.
    #[error("plugin '{name}' not found in registry")]
    NotFound {
        /// Name that was looked up.
        name: String,
    },

    /// A live plugin with the same name is already registered.
    #[error("plugin '{name}' is already registered")]
    AlreadyRegistered {
        /// Conflicting plugin name.
        name: String,
    },
}

impl PluginError {
    /// Returns the plugin name the error refers to, when there is one.
    #[must_use]
    pub fn plugin_name(&self) -> Option<&str> {
        match self {
            Self::InvalidSpec { .. } => None,
            Self::ExecutableNotFound { name, .. }
            | Self::SpawnFailed { name, .. }
            | Self::Handshake { name, .. }
            | Self::Connect { name, .. }
            | Self::Tls { name, .. }
            | Self::CapabilityNotExported { name, .. }
            | Self::Call { name, .. }
            | Self::NotFound { name }
            | Self::AlreadyRegistered { name } => Some(name.as_str()),
        }
    }

    /// Returns `true` when the error happened before the plugin was usable.
    #[must_use]
    pub const fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidSpec { .. }
                | Self::ExecutableNotFound { .. }
                | Self::SpawnFailed { .. }
                | Self::Handshake { .. }
                | Self::Connect { .. }
                | Self::Tls { .. }
        )
    }
}
