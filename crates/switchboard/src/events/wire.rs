//! Parameters and results of the `eventplugin` capability.

use serde::{Deserialize, Serialize};

use super::value::{EVENT_ENCODING, EventData};

/// Capability name every event plugin exports.
pub const EVENT_CAPABILITY: &str = "eventplugin";

/// Method announcing the events a plugin wants to observe.
pub const REGISTER_METHOD: &str = "register";

/// Method notifying a plugin of an event.
pub const TRIGGER_METHOD: &str = "trigger";

/// Parameters of `eventplugin.register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterParams {
    /// Event names the plugin is interested in.
    pub triggers: Vec<String>,
}

/// Parameters of `eventplugin.trigger`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerParams {
    /// Event name.
    pub event: String,
    /// Payload encoding version.
    pub encoding: u32,
    /// Positional arguments.
    #[serde(default)]
    pub args: EventData,
}

impl TriggerParams {
    /// Builds parameters with the current encoding version.
    #[must_use]
    pub fn new(event: impl Into<String>, args: EventData) -> Self {
        Self {
            event: event.into(),
            encoding: EVENT_ENCODING,
            args,
        }
    }
}

/// What a plugin reports after handling a trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerOutcome {
    /// The plugin acted on the event.
    pub handled: bool,
    /// Application-level failure reported by the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The handler faulted internally and the fault was contained.
    #[serde(default)]
    pub recovered: bool,
    /// Optional response payload.
    #[serde(default, skip_serializing_if = "EventData::is_empty")]
    pub reply: EventData,
}

impl TriggerOutcome {
    /// The plugin handled the event.
    #[must_use]
    pub fn handled() -> Self {
        Self {
            handled: true,
            ..Self::default()
        }
    }

    /// The plugin observed the event without acting on it.
    #[must_use]
    pub fn ignored() -> Self {
        Self::default()
    }

    /// The handler reported an application error.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// The handler panicked and the panic was caught.
    #[must_use]
    pub fn recovered_panic(message: &str) -> Self {
        Self {
            handled: false,
            error: Some(format!("plugin panicked: {message}")),
            recovered: true,
            reply: EventData::new(),
        }
    }

    /// Attaches a reply payload.
    #[must_use]
    pub fn with_reply(mut self, reply: EventData) -> Self {
        self.reply = reply;
        self
    }
}
