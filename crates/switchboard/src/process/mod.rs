//! Plugin child processes.
//!
//! [`PluginProcess::spawn`] launches a plugin executable, reads and validates
//! its handshake line, connects to the endpoint it announced (optionally
//! under mutual TLS), opens a [`Channel`] and confirms the peer answers a
//! ping. Any failure on the way kills the child before the error is
//! returned. [`PluginProcess::kill`] may be called any number of times.

mod lifecycle;
mod output;
mod state;

#[cfg(all(test, unix))]
mod tests;

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use self::lifecycle::{ChildGuard, terminate_child};
use self::output::{HandshakeReceiver, spawn_stderr_pump, spawn_stdout_reader};
use self::state::ProcessState;
use crate::capability::{CapabilitySet, Dispenser, HostCapability};
use crate::error::PluginError;
use crate::handshake::{
    CLIENT_CERT_ENV, HandshakeConfig, HandshakeError, HandshakeExpectation, HandshakeLine,
};
use crate::transport::tls::{self, SessionIdentity};
use crate::transport::{Channel, ChannelOptions, Conduit, DEFAULT_POLL_INTERVAL};

/// Log target for process lifecycle events.
pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");

/// Default budget for the handshake, connection and first ping.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default budget for a single call on a plugin channel.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the exit status of a plugin that closed stdout
/// before its handshake.
const EARLY_EXIT_WAIT: Duration = Duration::from_millis(500);

/// One configured plugin executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    name: String,
    path: PathBuf,
    args: Vec<String>,
    triggers: Vec<String>,
    auto_encrypt: bool,
}

impl PluginSpec {
    /// Describes the plugin at `path`, named after the file stem.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let executable = path.into();
        let name = executable
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            path: executable,
            args: Vec::new(),
            triggers: Vec::new(),
            auto_encrypt: false,
        }
    }

    /// Overrides the plugin name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the command-line arguments passed to the plugin.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the events the plugin is registered for once started.
    #[must_use]
    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    /// Requires a mutually authenticated TLS session.
    #[must_use]
    pub const fn with_auto_encrypt(mut self, auto_encrypt: bool) -> Self {
        self.auto_encrypt = auto_encrypt;
        self
    }

    /// Returns the plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the executable path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the plugin arguments.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Returns the events the plugin is registered for.
    #[must_use]
    pub fn triggers(&self) -> &[String] {
        &self.triggers
    }

    /// Returns whether the transport must be encrypted.
    #[must_use]
    pub const fn auto_encrypt(&self) -> bool {
        self.auto_encrypt
    }

    /// Checks that the plugin can be launched.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidSpec`] for an empty path or name.
    pub fn validate(&self) -> Result<(), PluginError> {
        if self.path.as_os_str().is_empty() {
            return Err(PluginError::InvalidSpec {
                message: String::from("plugin path must not be empty"),
            });
        }
        if self.name.trim().is_empty() {
            return Err(PluginError::InvalidSpec {
                message: format!("plugin at {} has no usable name", self.path.display()),
            });
        }
        Ok(())
    }
}

/// Settings applied to every plugin launch.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    startup_timeout: Duration,
    call_timeout: Duration,
    poll_interval: Duration,
    host_capabilities: CapabilitySet,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            host_capabilities: CapabilitySet::new().with(HostCapability),
        }
    }
}

impl LaunchOptions {
    /// Sets the handshake and connection budget.
    #[must_use]
    pub const fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Sets the budget for the startup ping and capability dispensing.
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the channel read poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Replaces the capabilities the host exports to plugins.
    #[must_use]
    pub fn with_host_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.host_capabilities = capabilities;
        self
    }

    /// Returns the startup budget.
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    /// Returns the per-call budget.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Returns the channel read poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Returns the capabilities the host exports.
    #[must_use]
    pub const fn host_capabilities(&self) -> &CapabilitySet {
        &self.host_capabilities
    }
}

/// A running plugin and the channel connected to it.
#[derive(Debug)]
pub struct PluginProcess {
    name: String,
    pid: u32,
    protocol_version: u32,
    capabilities: Vec<String>,
    encrypted: bool,
    channel: Channel,
    state: Mutex<ProcessState>,
}

impl PluginProcess {
    /// Launches the plugin described by `spec` and completes the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidSpec`], [`PluginError::ExecutableNotFound`]
    /// or [`PluginError::SpawnFailed`] when the child cannot be started,
    /// [`PluginError::Handshake`] when it does not prove it is a compatible
    /// plugin, [`PluginError::Connect`] or [`PluginError::Tls`] when its
    /// endpoint cannot be reached, and [`PluginError::Call`] when the first
    /// ping fails. The child is killed in every error case.
    pub fn spawn(
        spec: &PluginSpec,
        handshake: &HandshakeConfig,
        options: &LaunchOptions,
    ) -> Result<Self, PluginError> {
        spec.validate()?;
        check_executable(spec)?;
        let name = spec.name();

        let identity = spec
            .auto_encrypt()
            .then(SessionIdentity::generate)
            .transpose()
            .map_err(|source| PluginError::Tls {
                name: name.to_owned(),
                source,
            })?;

        let mut command = build_command(spec, handshake, identity.as_ref());
        debug!(
            target: PROCESS_TARGET,
            plugin = name,
            executable = %spec.path().display(),
            args = ?spec.args(),
            encrypted = identity.is_some(),
            "spawning plugin process"
        );
        let child = command
            .spawn()
            .map_err(|err| spawn_error(spec, err))?;
        let pid = child.id();
        let mut guard = ChildGuard::new(name, child);
        let handshake_lines = attach_output(name, &mut guard)?;

        let line = read_handshake(&handshake_lines, &mut guard, options.startup_timeout())
            .and_then(|received| {
                HandshakeExpectation::new(handshake, spec.auto_encrypt()).validate(&received)?;
                Ok(received)
            })
            .map_err(|source| PluginError::Handshake {
                name: name.to_owned(),
                source,
            })?;
        debug!(
            target: PROCESS_TARGET,
            plugin = name,
            pid,
            endpoint = %line.endpoint,
            capabilities = ?line.capabilities,
            "handshake accepted"
        );

        let conduit = connect(name, &line, identity.as_ref(), options.startup_timeout())?;
        let channel_options = ChannelOptions::default().with_poll_interval(options.poll_interval());
        let channel = Channel::open(
            name,
            conduit,
            Arc::new(options.host_capabilities().clone()),
            channel_options,
        )
        .map_err(|err| PluginError::SpawnFailed {
            name: name.to_owned(),
            message: format!("failed to open channel: {err}"),
            source: None,
        })?;

        if let Err(source) = channel.ping(options.call_timeout()) {
            channel.close();
            return Err(PluginError::Call {
                name: name.to_owned(),
                source,
            });
        }

        let child = guard.disarm().ok_or_else(|| PluginError::SpawnFailed {
            name: name.to_owned(),
            message: String::from("child handle lost during startup"),
            source: None,
        })?;
        info!(
            target: PROCESS_TARGET,
            plugin = name,
            pid,
            protocol_version = line.protocol_version,
            encrypted = identity.is_some(),
            "plugin started"
        );
        Ok(Self {
            name: name.to_owned(),
            pid,
            protocol_version: line.protocol_version,
            capabilities: line.capabilities,
            encrypted: identity.is_some(),
            channel,
            state: Mutex::new(ProcessState::Running { child }),
        })
    }

    /// Returns the plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the operating-system process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the protocol version agreed during the handshake.
    #[must_use]
    pub const fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Returns the capability names the plugin announced.
    #[must_use]
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Returns `true` when the channel runs under mutual TLS.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Returns the channel to the plugin.
    #[must_use]
    pub const fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Creates a dispenser for the plugin's capabilities.
    #[must_use]
    pub fn dispenser(&self, timeout: Duration) -> Dispenser {
        Dispenser::new(self.name.clone(), self.channel.clone(), timeout)
    }

    /// Returns `true` while the child runs and its channel is open.
    ///
    /// A child found to have exited is reaped and its channel closed.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        let mut state = self.lock_state();
        let ProcessState::Running { child } = &mut *state else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => !self.channel.is_closed(),
            Ok(Some(status)) => {
                info!(target: PROCESS_TARGET, plugin = %self.name, ?status, "plugin exited unexpectedly");
                self.channel.close();
                *state = ProcessState::Stopped {
                    status: Some(status),
                };
                false
            }
            Err(err) => {
                debug!(target: PROCESS_TARGET, plugin = %self.name, error = %err, "failed to poll plugin");
                false
            }
        }
    }

    /// Returns the exit status once the child has terminated.
    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match &mut *self.lock_state() {
            ProcessState::Running { child } => child.try_wait().ok().flatten(),
            ProcessState::Stopped { status } => *status,
        }
    }

    /// Closes the channel, failing in-flight calls, then terminates the child.
    ///
    /// The state lock is released before the child is reaped, so status
    /// queries and further `kill` calls return at once while it winds down.
    /// Subsequent calls do nothing.
    pub fn kill(&self) {
        let Some(mut child) = self.lock_state().take_child() else {
            return;
        };
        self.channel.close();
        let status = terminate_child(&self.name, &mut child);
        *self.lock_state() = ProcessState::Stopped { status };
        debug!(target: PROCESS_TARGET, plugin = %self.name, "plugin stopped");
    }

    fn lock_state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PluginProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Rejects paths with a directory part that do not exist; bare names are
/// resolved through `PATH` at spawn time.
fn check_executable(spec: &PluginSpec) -> Result<(), PluginError> {
    let path = spec.path();
    if path.components().count() > 1 && !path.exists() {
        return Err(PluginError::ExecutableNotFound {
            name: spec.name().to_owned(),
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn build_command(
    spec: &PluginSpec,
    handshake: &HandshakeConfig,
    identity: Option<&SessionIdentity>,
) -> Command {
    let mut command = Command::new(spec.path());
    command
        .args(spec.args())
        .envs(handshake.child_environment())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    match identity {
        Some(session) => command.env(CLIENT_CERT_ENV, session.certificate_base64()),
        None => command.env_remove(CLIENT_CERT_ENV),
    };
    command
}

fn spawn_error(spec: &PluginSpec, err: std::io::Error) -> PluginError {
    if err.kind() == std::io::ErrorKind::NotFound {
        return PluginError::ExecutableNotFound {
            name: spec.name().to_owned(),
            path: spec.path().to_path_buf(),
        };
    }
    PluginError::SpawnFailed {
        name: spec.name().to_owned(),
        message: err.to_string(),
        source: Some(Arc::new(err)),
    }
}

fn attach_output(name: &str, guard: &mut ChildGuard<'_>) -> Result<HandshakeReceiver, PluginError> {
    let capture_error = |message: &str| PluginError::SpawnFailed {
        name: name.to_owned(),
        message: message.to_owned(),
        source: None,
    };
    let io_error = |err: std::io::Error| PluginError::SpawnFailed {
        name: name.to_owned(),
        message: String::from("failed to start output readers"),
        source: Some(Arc::new(err)),
    };
    let child = guard
        .child_mut()
        .ok_or_else(|| capture_error("child handle lost during startup"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| capture_error("failed to capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| capture_error("failed to capture stderr"))?;
    spawn_stderr_pump(name, stderr).map_err(io_error)?;
    spawn_stdout_reader(name, stdout).map_err(io_error)
}

fn read_handshake(
    lines: &HandshakeReceiver,
    guard: &mut ChildGuard<'_>,
    timeout: Duration,
) -> Result<HandshakeLine, HandshakeError> {
    match lines.recv_timeout(timeout) {
        Ok(Ok(Some(line))) => HandshakeLine::parse(&line),
        Ok(Ok(None)) | Err(RecvTimeoutError::Disconnected) => Err(HandshakeError::Closed {
            status: guard.exit_code(EARLY_EXIT_WAIT),
        }),
        Ok(Err(err)) => Err(HandshakeError::Malformed {
            message: format!("failed to read handshake: {err}"),
        }),
        Err(RecvTimeoutError::Timeout) => Err(HandshakeError::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

fn connect(
    name: &str,
    line: &HandshakeLine,
    identity: Option<&SessionIdentity>,
    timeout: Duration,
) -> Result<Box<dyn Conduit>, PluginError> {
    let endpoint = line.endpoint().map_err(|source| PluginError::Handshake {
        name: name.to_owned(),
        source,
    })?;
    let sock = endpoint
        .connect(timeout)
        .map_err(|err| PluginError::Connect {
            name: name.to_owned(),
            endpoint: endpoint.to_string(),
            source: Arc::new(err),
        })?;
    let (Some(session), Some(server_cert)) = (identity, line.server_cert.as_deref()) else {
        return Ok(sock);
    };
    let tls_error = |source| PluginError::Tls {
        name: name.to_owned(),
        source,
    };
    let peer = tls::decode_certificate(server_cert).map_err(tls_error)?;
    let conduit = tls::connect(sock, session, &peer, timeout).map_err(tls_error)?;
    debug!(target: PROCESS_TARGET, plugin = name, "mutual TLS established");
    Ok(Box::new(conduit))
}
