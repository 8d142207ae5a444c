//! Host-side fan-out of triggers to live plugins.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::EVENTS_TARGET;
use super::value::EventData;
use super::wire::TriggerOutcome;
use crate::error::PluginError;
use crate::registry::{PluginHandle, PluginRegistry, PluginStatus};
use crate::transport::jsonrpc::PARSE_ERROR;
use crate::transport::{CallError, panic_message};

/// Default upper bound on concurrent trigger calls.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

const DEFAULT_TRIGGER_TIMEOUT: Duration = Duration::from_secs(5);

/// How triggers are fanned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPolicy {
    call_timeout: Duration,
    max_concurrency: usize,
    filter_by_registration: bool,
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_TRIGGER_TIMEOUT,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            filter_by_registration: false,
        }
    }
}

impl TriggerPolicy {
    /// Sets the budget for each plugin's reply.
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the number of plugins called at once; zero is treated as one.
    #[must_use]
    pub const fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = if max_concurrency == 0 { 1 } else { max_concurrency };
        self
    }

    /// Only calls plugins that registered for the triggered event.
    #[must_use]
    pub const fn with_filter_by_registration(mut self, filter: bool) -> Self {
        self.filter_by_registration = filter;
        self
    }

    /// Returns the per-plugin budget.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Returns the concurrency bound.
    #[must_use]
    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Returns `true` when fan-out skips unsubscribed plugins.
    #[must_use]
    pub const fn filter_by_registration(&self) -> bool {
        self.filter_by_registration
    }
}

/// Why one plugin did not deliver a clean result.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerError {
    /// The channel to the plugin is gone; the plugin has been pruned.
    #[error("transport failure: {reason}")]
    Transport {
        /// Why the channel closed.
        reason: String,
    },
    /// The plugin did not reply in time and is now suspect.
    #[error("no reply within {timeout_ms}ms")]
    Timeout {
        /// Budget in milliseconds.
        timeout_ms: u64,
    },
    /// The plugin's handler reported an error, or panicked and recovered.
    #[error("plugin error: {message}")]
    Remote {
        /// Message from the handler.
        message: String,
    },
    /// The plugin refused the call at the protocol level.
    #[error("plugin rejected the call ({code}): {message}")]
    Rejected {
        /// JSON-RPC error code.
        code: i64,
        /// Error message.
        message: String,
    },
}

impl TriggerError {
    /// Classifies a failed trigger call.
    #[must_use]
    pub fn from_call(error: CallError) -> Self {
        match error {
            CallError::Closed { reason } => Self::Transport { reason },
            CallError::Timeout { timeout_ms, .. } => Self::Timeout { timeout_ms },
            CallError::Remote { code, message } => Self::Rejected { code, message },
            CallError::Codec { message } => Self::Rejected {
                code: PARSE_ERROR,
                message,
            },
        }
    }

    /// Returns `true` for failures caused by a dead channel.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// One plugin's part of a trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventTriggerResult {
    /// Plugin name.
    pub plugin: String,
    /// The plugin acted on the event.
    pub handled: bool,
    /// Failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TriggerError>,
    /// The plugin faulted internally and recovered.
    pub recovered: bool,
    /// Reply payload.
    #[serde(skip_serializing_if = "EventData::is_empty")]
    pub reply: EventData,
}

impl EventTriggerResult {
    /// Builds a result from what the plugin reported.
    #[must_use]
    pub fn from_outcome(plugin: impl Into<String>, outcome: TriggerOutcome) -> Self {
        Self {
            plugin: plugin.into(),
            handled: outcome.handled,
            error: outcome.error.map(|message| TriggerError::Remote { message }),
            recovered: outcome.recovered,
            reply: outcome.reply,
        }
    }

    /// Builds a result for a call that did not complete.
    #[must_use]
    pub fn failed(plugin: impl Into<String>, error: TriggerError) -> Self {
        Self {
            plugin: plugin.into(),
            handled: false,
            error: Some(error),
            recovered: false,
            reply: EventData::new(),
        }
    }
}

/// Merged outcome of one trigger across plugins.
///
/// The default value, produced when no plugin was called, is neutral:
/// nothing handled, nothing recovered, no errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatedResult {
    /// At least one plugin handled the event.
    pub handled: bool,
    /// At least one plugin recovered from an internal fault.
    pub recovered: bool,
    /// Every failure, in plugin order.
    pub errors: Vec<TriggerError>,
    /// Per-plugin results in registry order.
    pub results: Vec<EventTriggerResult>,
}

impl AggregatedResult {
    /// Folds per-plugin results.
    #[must_use]
    pub fn from_results(results: Vec<EventTriggerResult>) -> Self {
        Self {
            handled: results.iter().any(|result| result.handled),
            recovered: results.iter().any(|result| result.recovered),
            errors: results
                .iter()
                .filter_map(|result| result.error.clone())
                .collect(),
            results,
        }
    }

    /// Returns the first failure.
    #[must_use]
    pub fn first_error(&self) -> Option<&TriggerError> {
        self.errors.first()
    }

    /// Returns the result reported by `plugin`.
    #[must_use]
    pub fn result_for(&self, plugin: &str) -> Option<&EventTriggerResult> {
        self.results.iter().find(|result| result.plugin == plugin)
    }
}

/// What [`EventDispatcher::health_check`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Suspect plugins that answered and are live again.
    pub restored: Vec<String>,
    /// Plugins found dead or unresponsive and removed.
    pub pruned: Vec<String>,
}

/// Sends triggers to the plugins in a shared registry.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    registry: Arc<PluginRegistry>,
    policy: TriggerPolicy,
}

impl EventDispatcher {
    /// Creates a dispatcher over `registry`.
    #[must_use]
    pub const fn new(registry: Arc<PluginRegistry>, policy: TriggerPolicy) -> Self {
        Self { registry, policy }
    }

    /// Returns the registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Returns the fan-out policy.
    #[must_use]
    pub const fn policy(&self) -> &TriggerPolicy {
        &self.policy
    }

    /// Tells `plugin` which events to observe and records the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for unknown plugins and
    /// [`PluginError::Call`] when the plugin does not accept the list. A
    /// plugin whose channel is gone is pruned.
    pub fn register(&self, plugin: &str, triggers: &[String]) -> Result<(), PluginError> {
        let handle = self.registry.get(plugin).ok_or_else(|| PluginError::NotFound {
            name: plugin.to_owned(),
        })?;
        match handle.events().register(triggers, self.policy.call_timeout()) {
            Ok(()) => {
                handle.set_subscriptions(triggers);
                debug!(target: EVENTS_TARGET, plugin, ?triggers, "plugin registered triggers");
                Ok(())
            }
            Err(source) => {
                if source.is_transport_failure() {
                    self.prune(&handle, &source.to_string());
                }
                Err(PluginError::Call {
                    name: plugin.to_owned(),
                    source,
                })
            }
        }
    }

    /// Notifies every live plugin of `event` and merges their results.
    ///
    /// Never fails: transport failures, timeouts and plugin errors are
    /// reported inside the result. Dead plugins are pruned and plugins that
    /// time out are marked suspect.
    #[must_use]
    pub fn trigger(&self, event: &str, data: &EventData) -> AggregatedResult {
        let targets: Vec<Arc<PluginHandle>> = self
            .registry
            .live()
            .into_iter()
            .filter(|handle| !self.policy.filter_by_registration() || handle.is_subscribed(event))
            .collect();
        if targets.is_empty() {
            debug!(target: EVENTS_TARGET, event, "no plugins to trigger");
            return AggregatedResult::default();
        }
        debug!(target: EVENTS_TARGET, event, plugins = targets.len(), args = data.len(), "triggering event");
        let aggregated = AggregatedResult::from_results(self.fan_out(&targets, event, data));
        debug!(
            target: EVENTS_TARGET,
            event,
            handled = aggregated.handled,
            recovered = aggregated.recovered,
            errors = aggregated.errors.len(),
            "trigger complete"
        );
        aggregated
    }

    /// Pings suspect plugins and prunes dead ones.
    ///
    /// A suspect that answers goes back into service; one that does not is
    /// killed and removed, as is any plugin whose process or channel died.
    #[must_use]
    pub fn health_check(&self) -> HealthReport {
        let mut report = HealthReport::default();
        for handle in self.registry.snapshot() {
            if !handle.is_alive() {
                self.prune(&handle, "plugin is no longer running");
                report.pruned.push(handle.name().to_owned());
                continue;
            }
            if handle.status() != PluginStatus::Suspect {
                continue;
            }
            match handle.ping(self.policy.call_timeout()) {
                Ok(()) => {
                    handle.mark_live();
                    info!(target: EVENTS_TARGET, plugin = %handle.name(), "suspect plugin answered, back in service");
                    report.restored.push(handle.name().to_owned());
                }
                Err(err) => {
                    self.prune(&handle, &err.to_string());
                    report.pruned.push(handle.name().to_owned());
                }
            }
        }
        report
    }

    fn fan_out(
        &self,
        targets: &[Arc<PluginHandle>],
        event: &str,
        data: &EventData,
    ) -> Vec<EventTriggerResult> {
        let next = AtomicUsize::new(0);
        let slots: Vec<Mutex<Option<EventTriggerResult>>> =
            targets.iter().map(|_| Mutex::new(None)).collect();
        let workers = self.policy.max_concurrency().min(targets.len());

        thread::scope(|scope| {
            let running: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(|| {
                        loop {
                            let index = next.fetch_add(1, Ordering::SeqCst);
                            let (Some(handle), Some(slot)) = (targets.get(index), slots.get(index))
                            else {
                                break;
                            };
                            let result = self.invoke(handle, event, data);
                            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
                        }
                    })
                })
                .collect();
            for worker in running {
                if worker.join().is_err() {
                    warn!(target: EVENTS_TARGET, event, "dispatch worker panicked");
                }
            }
        });

        slots
            .into_iter()
            .zip(targets)
            .map(|(slot, handle)| {
                slot.into_inner()
                    .unwrap_or_else(PoisonError::into_inner)
                    .unwrap_or_else(|| {
                        EventTriggerResult::failed(
                            handle.name(),
                            TriggerError::Transport {
                                reason: String::from("dispatch worker stopped before calling the plugin"),
                            },
                        )
                    })
            })
            .collect()
    }

    fn invoke(&self, handle: &PluginHandle, event: &str, data: &EventData) -> EventTriggerResult {
        let timeout = self.policy.call_timeout();
        let call = panic::catch_unwind(AssertUnwindSafe(|| {
            handle.events().trigger(event, data, timeout)
        }));
        let outcome = match call {
            Ok(outcome) => outcome,
            Err(payload) => Err(CallError::Closed {
                reason: format!("dispatch panicked: {}", panic_message(payload.as_ref())),
            }),
        };
        match outcome {
            Ok(reported) => {
                if reported.recovered {
                    warn!(
                        target: EVENTS_TARGET,
                        plugin = %handle.name(),
                        event,
                        error = reported.error.as_deref().unwrap_or_default(),
                        "plugin recovered from an internal fault"
                    );
                }
                EventTriggerResult::from_outcome(handle.name(), reported)
            }
            Err(err) => {
                let error = TriggerError::from_call(err);
                match &error {
                    TriggerError::Transport { reason } => self.prune(handle, reason),
                    TriggerError::Timeout { timeout_ms } => {
                        warn!(target: EVENTS_TARGET, plugin = %handle.name(), event, timeout_ms, "plugin timed out, marking suspect");
                        handle.mark_suspect();
                    }
                    TriggerError::Remote { .. } | TriggerError::Rejected { .. } => {
                        warn!(target: EVENTS_TARGET, plugin = %handle.name(), event, %error, "plugin rejected trigger");
                    }
                }
                EventTriggerResult::failed(handle.name(), error)
            }
        }
    }

    fn prune(&self, handle: &PluginHandle, reason: &str) {
        warn!(target: EVENTS_TARGET, plugin = %handle.name(), reason, "pruning dead plugin");
        handle.kill();
        if self.registry.remove_if_current(handle).is_some() {
            debug!(target: EVENTS_TARGET, plugin = %handle.name(), "plugin removed from dispatch");
        }
    }
}
