//! Host bootstrap: start configured plugins and dispatch events to them.
//!
//! A plugin that fails to start is logged and left out; the host carries on
//! with whatever subset started, including none at all.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::PluginError;
use crate::events::{
    AggregatedResult, EventData, EventDispatcher, HealthReport, RPC_INIT_EVENT, TriggerPolicy,
    rpc_init_data,
};
use crate::handshake::HandshakeConfig;
use crate::process::{LaunchOptions, PluginProcess, PluginSpec};
use crate::registry::{PluginHandle, PluginRegistry};

const HOST_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::host");

/// A plugin that could not be started.
#[derive(Debug)]
pub struct StartFailure {
    /// Name of the plugin.
    pub plugin: String,
    /// Why it failed.
    pub error: PluginError,
}

/// Result of [`PluginHost::start_all`].
#[derive(Debug, Default)]
pub struct StartReport {
    /// Names of the plugins now serving, in start order.
    pub started: Vec<String>,
    /// Plugins that were left out.
    pub failed: Vec<StartFailure>,
}

/// Owns every started plugin and the dispatcher that reaches them.
#[derive(Debug)]
pub struct PluginHost {
    handshake: HandshakeConfig,
    launch: LaunchOptions,
    dispatcher: EventDispatcher,
}

impl PluginHost {
    /// Creates a host with no plugins.
    #[must_use]
    pub fn new(handshake: HandshakeConfig, launch: LaunchOptions, policy: TriggerPolicy) -> Self {
        Self {
            handshake,
            launch,
            dispatcher: EventDispatcher::new(Arc::new(PluginRegistry::new()), policy),
        }
    }

    /// Returns the dispatcher used for triggers.
    #[must_use]
    pub const fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Returns the registry of started plugins.
    #[must_use]
    pub const fn registry(&self) -> &Arc<PluginRegistry> {
        self.dispatcher.registry()
    }

    /// Returns the handshake every plugin must complete.
    #[must_use]
    pub const fn handshake(&self) -> &HandshakeConfig {
        &self.handshake
    }

    /// Starts one plugin.
    ///
    /// The plugin is spawned, its `eventplugin` capability dispensed, its
    /// triggers registered and an `rpc-init` event delivered before it joins
    /// the registry.
    ///
    /// # Errors
    ///
    /// Returns the first [`PluginError`] raised on the way; the plugin is
    /// stopped before the error is returned.
    pub fn start(&self, spec: &PluginSpec) -> Result<Arc<PluginHandle>, PluginError> {
        let timeout = self.launch.call_timeout();
        let process = PluginProcess::spawn(spec, &self.handshake, &self.launch)?;
        let handle = PluginHandle::from_process(process, timeout)?;

        handle
            .events()
            .register(spec.triggers(), timeout)
            .map_err(|source| PluginError::Call {
                name: spec.name().to_owned(),
                source,
            })?;
        handle.set_subscriptions(spec.triggers());

        match handle
            .events()
            .trigger(RPC_INIT_EVENT, &rpc_init_data(), timeout)
        {
            Ok(outcome) => info!(
                target: HOST_TARGET,
                plugin = spec.name(),
                handled = outcome.handled,
                recovered = outcome.recovered,
                error = outcome.error.as_deref().unwrap_or_default(),
                "rpc-init delivered"
            ),
            Err(source) if source.is_transport_failure() => {
                handle.kill();
                return Err(PluginError::Call {
                    name: spec.name().to_owned(),
                    source,
                });
            }
            Err(err) => {
                warn!(target: HOST_TARGET, plugin = spec.name(), error = %err, "rpc-init failed");
            }
        }

        self.registry().insert(handle)
    }

    /// Starts every plugin in `specs`, skipping those that fail.
    pub fn start_all(&self, specs: &[PluginSpec]) -> StartReport {
        let mut report = StartReport::default();
        for spec in specs {
            match self.start(spec) {
                Ok(handle) => report.started.push(handle.name().to_owned()),
                Err(error) => {
                    warn!(
                        target: HOST_TARGET,
                        plugin = spec.name(),
                        path = %spec.path().display(),
                        %error,
                        "plugin failed to start, continuing without it"
                    );
                    report.failed.push(StartFailure {
                        plugin: spec.name().to_owned(),
                        error,
                    });
                }
            }
        }
        info!(
            target: HOST_TARGET,
            started = report.started.len(),
            failed = report.failed.len(),
            "plugin startup complete"
        );
        report
    }

    /// Triggers `event` on every live plugin.
    #[must_use]
    pub fn trigger(&self, event: &str, data: &EventData) -> AggregatedResult {
        self.dispatcher.trigger(event, data)
    }

    /// Re-admits responsive suspects and prunes dead plugins.
    #[must_use]
    pub fn health_check(&self) -> HealthReport {
        self.dispatcher.health_check()
    }

    /// Stops every plugin. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let handles = self.registry().drain();
        if handles.is_empty() {
            return;
        }
        info!(target: HOST_TARGET, plugins = handles.len(), "shutting down plugins");
        for handle in handles {
            handle.kill();
        }
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests;
