//! Host-side typed wrapper over a dispensed `eventplugin` stub.

use std::time::Duration;

use super::value::EventData;
use super::wire::{
    EVENT_CAPABILITY, REGISTER_METHOD, RegisterParams, TRIGGER_METHOD, TriggerOutcome,
    TriggerParams,
};
use crate::capability::{Dispenser, Stub};
use crate::error::PluginError;
use crate::transport::CallError;

/// Calls `register` and `trigger` on one plugin.
#[derive(Debug, Clone)]
pub struct EventClient {
    stub: Stub,
}

impl EventClient {
    /// Dispenses the `eventplugin` capability.
    ///
    /// # Errors
    ///
    /// Propagates the dispenser's [`PluginError`].
    pub fn dispense(dispenser: &Dispenser) -> Result<Self, PluginError> {
        dispenser.dispense(EVENT_CAPABILITY).map(Self::from_stub)
    }

    /// Wraps an already dispensed stub.
    #[must_use]
    pub const fn from_stub(stub: Stub) -> Self {
        Self { stub }
    }

    /// Returns the plugin name.
    #[must_use]
    pub fn plugin(&self) -> &str {
        self.stub.plugin()
    }

    /// Returns the underlying stub.
    #[must_use]
    pub const fn stub(&self) -> &Stub {
        &self.stub
    }

    /// Tells the plugin which events it should observe.
    ///
    /// # Errors
    ///
    /// Propagates the call failure.
    pub fn register(&self, triggers: &[String], timeout: Duration) -> Result<(), CallError> {
        let params = RegisterParams {
            triggers: triggers.to_vec(),
        };
        self.stub
            .call_typed::<_, serde_json::Value>(REGISTER_METHOD, &params, timeout)
            .map(|_| ())
    }

    /// Notifies the plugin of `event`.
    ///
    /// # Errors
    ///
    /// Propagates the call failure; handler faults are reported inside the
    /// returned outcome instead.
    pub fn trigger(
        &self,
        event: &str,
        args: &EventData,
        timeout: Duration,
    ) -> Result<TriggerOutcome, CallError> {
        let params = TriggerParams::new(event, args.clone());
        self.stub.call_typed(TRIGGER_METHOD, &params, timeout)
    }
}
