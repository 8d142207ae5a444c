//! Plugin-side entry point.
//!
//! A plugin binary calls [`serve`] from `main`. It verifies the cookie the
//! host exported, negotiates a protocol version, binds a private endpoint,
//! announces it with a [`HandshakeLine`] on stdout and then serves its
//! capabilities until the host disconnects.
//!
//! ```no_run
//! use switchboard::events::{EventData, EventHandler, TriggerOutcome};
//! use switchboard::serve::{ServeConfig, serve};
//!
//! struct Quiet;
//!
//! impl EventHandler for Quiet {
//!     fn register(&self, _triggers: &[String]) {}
//!
//!     fn trigger(&self, _event: &str, _args: &EventData) -> TriggerOutcome {
//!         TriggerOutcome::handled()
//!     }
//! }
//!
//! # fn main() -> Result<(), switchboard::serve::ServeError> {
//! serve(ServeConfig::events("quiet", Quiet))
//! # }
//! ```

use std::env;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::capability::{CapabilityServer, CapabilitySet};
use crate::events::{EventHandler, EventServer};
use crate::handshake::{
    CLIENT_CERT_ENV, CORE_PROTOCOL_VERSION, DEFAULT_PROTOCOL_VERSION, HandshakeConfig,
    HandshakeError, HandshakeLine, PROTOCOL_VERSIONS_ENV, negotiate_version, parse_version_list,
};
use crate::transport::tls::{self, SessionIdentity};
use crate::transport::{
    Channel, ChannelOptions, Conduit, Endpoint, EndpointListener, TlsError, TransportError,
};

const SERVE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::serve");

/// How long a plugin waits for the host to connect after announcing itself.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

const CLOSE_POLL: Duration = Duration::from_millis(50);

/// Errors that end a plugin's [`serve`] loop.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The host's bootstrap environment was rejected.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The endpoint could not be bound or accepted.
    #[error("{context}: {source}")]
    Io {
        /// Step that failed.
        context: &'static str,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The encrypted session could not be set up.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The channel could not be opened.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The handshake line could not be serialised.
    #[error("failed to encode handshake line: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ServeError {
    fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Io { context, source }
    }

    /// Returns `true` when the host's cookie was missing or wrong, meaning the
    /// binary was not launched by a host.
    #[must_use]
    pub const fn is_cookie_failure(&self) -> bool {
        matches!(
            self,
            Self::Handshake(
                HandshakeError::MissingCookie { .. } | HandshakeError::CookieValueMismatch { .. }
            )
        )
    }
}

/// What a plugin serves and how it answers the handshake.
#[derive(Debug)]
pub struct ServeConfig {
    name: String,
    handshake: HandshakeConfig,
    supported_versions: Vec<u32>,
    capabilities: CapabilitySet,
    accept_timeout: Duration,
    channel_options: ChannelOptions,
}

impl ServeConfig {
    /// Creates a configuration serving nothing yet.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handshake: HandshakeConfig::default(),
            supported_versions: vec![DEFAULT_PROTOCOL_VERSION],
            capabilities: CapabilitySet::new(),
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            channel_options: ChannelOptions::default(),
        }
    }

    /// Creates a configuration serving `eventplugin` through `handler`.
    #[must_use]
    pub fn events<H: EventHandler + 'static>(name: impl Into<String>, handler: H) -> Self {
        Self::new(name).with_capability(EventServer::new(handler))
    }

    /// Adds a capability.
    #[must_use]
    pub fn with_capability(mut self, server: impl CapabilityServer + 'static) -> Self {
        self.capabilities.insert(Arc::new(server));
        self
    }

    /// Overrides the cookie the plugin expects.
    #[must_use]
    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    /// Sets the protocol versions the plugin speaks.
    #[must_use]
    pub fn with_supported_versions(mut self, versions: impl Into<Vec<u32>>) -> Self {
        self.supported_versions = versions.into();
        self
    }

    /// Sets how long to wait for the host to connect.
    #[must_use]
    pub const fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Returns the plugin name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the names of the served capabilities.
    #[must_use]
    pub fn capability_names(&self) -> Vec<String> {
        self.capabilities.names()
    }
}

/// Serves `config` using the process environment and stdout.
///
/// Blocks until the host disconnects.
///
/// # Errors
///
/// Returns [`ServeError`] when the cookie is missing or wrong, no protocol
/// version is shared, or the endpoint cannot be set up.
pub fn serve(config: ServeConfig) -> Result<(), ServeError> {
    serve_with(config, |key| env::var(key).ok(), io::stdout())
}

/// Serves `config` reading bootstrap variables through `lookup` and writing
/// the handshake line to `announce`.
///
/// # Errors
///
/// See [`serve`].
pub fn serve_with<F, W>(config: ServeConfig, lookup: F, mut announce: W) -> Result<(), ServeError>
where
    F: Fn(&str) -> Option<String>,
    W: Write,
{
    config.handshake.check_cookie(&lookup)?;
    let protocol_version = negotiate(&config, lookup(PROTOCOL_VERSIONS_ENV).as_deref())?;
    let client_cert = lookup(CLIENT_CERT_ENV)
        .map(|text| tls::decode_certificate(&text))
        .transpose()?;
    let identity = client_cert
        .as_ref()
        .map(|_| SessionIdentity::generate())
        .transpose()?;

    let (listener, _socket_dir) = bind_private_endpoint()?;
    let line = HandshakeLine {
        core_version: CORE_PROTOCOL_VERSION,
        protocol_version,
        cookie_key: config.handshake.cookie_key().to_owned(),
        cookie_value: config.handshake.cookie_value().to_owned(),
        endpoint: listener.endpoint().to_string(),
        capabilities: config.capabilities.names(),
        server_cert: identity.as_ref().map(SessionIdentity::certificate_base64),
    };
    writeln!(announce, "{}", line.to_json()?).map_err(ServeError::io("failed to announce"))?;
    announce.flush().map_err(ServeError::io("failed to announce"))?;
    debug!(
        target: SERVE_TARGET,
        plugin = %config.name,
        endpoint = %listener.endpoint(),
        protocol_version,
        encrypted = identity.is_some(),
        "handshake announced"
    );

    let plain = listener
        .accept(config.accept_timeout)
        .map_err(ServeError::io("host did not connect"))?;
    let conduit: Box<dyn Conduit> = match (identity, client_cert) {
        (Some(identity), Some(client_cert)) => Box::new(tls::accept(
            plain,
            &identity,
            &client_cert,
            config.accept_timeout,
        )?),
        _ => plain,
    };

    let channel = Channel::open(
        config.name.clone(),
        conduit,
        Arc::new(config.capabilities),
        config.channel_options,
    )?;
    info!(target: SERVE_TARGET, plugin = %config.name, "serving host");
    while !channel.is_closed() {
        thread::sleep(CLOSE_POLL);
    }
    info!(
        target: SERVE_TARGET,
        plugin = %config.name,
        reason = channel.close_reason().unwrap_or_default(),
        "host disconnected"
    );
    Ok(())
}

fn negotiate(config: &ServeConfig, offered: Option<&str>) -> Result<u32, ServeError> {
    let host_accepts = offered.map_or_else(
        || Ok(vec![config.handshake.protocol_version()]),
        parse_version_list,
    )?;
    negotiate_version(&host_accepts, &config.supported_versions).ok_or_else(|| {
        ServeError::Handshake(HandshakeError::NoCommonVersion {
            offered: join_versions(&host_accepts),
            supported: join_versions(&config.supported_versions),
        })
    })
}

fn join_versions(versions: &[u32]) -> String {
    versions
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(unix)]
fn bind_private_endpoint() -> Result<(EndpointListener, Option<tempfile::TempDir>), ServeError> {
    let dir = tempfile::Builder::new()
        .prefix("switchboard-plugin-")
        .tempdir()
        .map_err(ServeError::io("failed to create socket directory"))?;
    let path = Utf8PathBuf::from_path_buf(dir.path().join("plugin.sock")).map_err(|path| {
        ServeError::Io {
            context: "socket path is not UTF-8",
            source: io::Error::new(io::ErrorKind::InvalidInput, path.display().to_string()),
        }
    })?;
    let listener = EndpointListener::bind(&Endpoint::unix(path))
        .map_err(ServeError::io("failed to bind plugin socket"))?;
    Ok((listener, Some(dir)))
}

#[cfg(not(unix))]
fn bind_private_endpoint() -> Result<(EndpointListener, Option<tempfile::TempDir>), ServeError> {
    let listener = EndpointListener::bind(&Endpoint::tcp("127.0.0.1", 0))
        .map_err(ServeError::io("failed to bind plugin socket"))?;
    Ok((listener, None))
}

/// Installs a JSON subscriber writing to stderr.
///
/// The host parses these records back into its plugin log. `RUST_LOG`
/// overrides `default_filter`. Calling it again after a subscriber is
/// installed has no effect.
pub fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let installed = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .try_init();
    if installed.is_err() {
        debug!(target: SERVE_TARGET, "subscriber already installed");
    }
}

#[cfg(test)]
mod tests;
