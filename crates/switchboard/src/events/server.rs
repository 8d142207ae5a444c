//! Plugin-side half of the `eventplugin` capability.

use std::panic::{self, AssertUnwindSafe};

use serde_json::Value;
use tracing::{debug, warn};

use super::EVENTS_TARGET;
use super::value::{EVENT_ENCODING, EventData};
use super::wire::{
    EVENT_CAPABILITY, REGISTER_METHOD, RegisterParams, TRIGGER_METHOD, TriggerOutcome,
    TriggerParams,
};
use crate::capability::{CallContext, CapabilityServer};
use crate::transport::jsonrpc::RpcError;
use crate::transport::panic_message;

/// Behaviour a plugin supplies for event notifications.
#[cfg_attr(test, mockall::automock)]
pub trait EventHandler: Send + Sync {
    /// Records the events the host says this plugin should observe.
    fn register(&self, triggers: &[String]);

    /// Handles one event.
    fn trigger(&self, event: &str, args: &EventData) -> TriggerOutcome;
}

/// A decoded `eventplugin` call.
#[derive(Debug, Clone, PartialEq)]
pub enum EventCall {
    /// `eventplugin.register`.
    Register(RegisterParams),
    /// `eventplugin.trigger`.
    Trigger(TriggerParams),
}

impl EventCall {
    /// Decodes the method and parameters of an incoming call.
    ///
    /// # Errors
    ///
    /// Returns `method not found` for unknown methods and `invalid params`
    /// for undecodable parameters or an unsupported payload encoding.
    pub fn decode(method: &str, params: Value) -> Result<Self, RpcError> {
        let invalid = |err: serde_json::Error| RpcError::invalid_params(err.to_string());
        match method {
            REGISTER_METHOD => serde_json::from_value(params)
                .map(Self::Register)
                .map_err(invalid),
            TRIGGER_METHOD => {
                let trigger: TriggerParams = serde_json::from_value(params).map_err(invalid)?;
                if trigger.encoding != EVENT_ENCODING {
                    return Err(RpcError::invalid_params(format!(
                        "unsupported event encoding {} (expected {EVENT_ENCODING})",
                        trigger.encoding
                    )));
                }
                Ok(Self::Trigger(trigger))
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

/// Serves `eventplugin` by delegating to an [`EventHandler`].
///
/// A panic inside the handler never crosses the channel: `trigger` panics
/// become an outcome with `recovered = true`.
#[derive(Debug)]
pub struct EventServer<H> {
    handler: H,
}

impl<H: EventHandler> EventServer<H> {
    /// Wraps a handler.
    #[must_use]
    pub const fn new(handler: H) -> Self {
        Self { handler }
    }

    /// Returns the wrapped handler.
    #[must_use]
    pub const fn handler(&self) -> &H {
        &self.handler
    }

    /// Runs a decoded call against the handler.
    ///
    /// # Errors
    ///
    /// Returns an internal error when `register` panics.
    pub fn dispatch(&self, call: EventCall) -> Result<Value, RpcError> {
        match call {
            EventCall::Register(params) => {
                debug!(target: EVENTS_TARGET, triggers = ?params.triggers, "register called");
                panic::catch_unwind(AssertUnwindSafe(|| self.handler.register(&params.triggers)))
                    .map(|()| Value::Null)
                    .map_err(|payload| {
                        RpcError::internal(format!(
                            "plugin panicked during register: {}",
                            panic_message(payload.as_ref())
                        ))
                    })
            }
            EventCall::Trigger(params) => {
                let outcome = self.run_trigger(&params.event, &params.args);
                serde_json::to_value(outcome).map_err(|err| RpcError::internal(err.to_string()))
            }
        }
    }

    fn run_trigger(&self, event: &str, args: &EventData) -> TriggerOutcome {
        debug!(target: EVENTS_TARGET, event, args = args.len(), "trigger called");
        panic::catch_unwind(AssertUnwindSafe(|| self.handler.trigger(event, args))).unwrap_or_else(
            |payload| {
                let message = panic_message(payload.as_ref());
                warn!(target: EVENTS_TARGET, event, panic = %message, "handler panicked");
                TriggerOutcome::recovered_panic(&message)
            },
        )
    }
}

impl<H: EventHandler> CapabilityServer for EventServer<H> {
    fn name(&self) -> &str {
        EVENT_CAPABILITY
    }

    fn call(&self, method: &str, params: Value, _context: &CallContext<'_>) -> Result<Value, RpcError> {
        self.dispatch(EventCall::decode(method, params)?)
    }
}
