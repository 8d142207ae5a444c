//! The `eventplugin` capability and host-side event dispatch.
//!
//! Plugins implement [`EventHandler`] and serve it through [`EventServer`].
//! The host talks to each plugin through an [`EventClient`] and fans
//! triggers out to every live plugin with an [`EventDispatcher`], which folds
//! the per-plugin [`EventTriggerResult`]s into one [`AggregatedResult`].

mod client;
mod dispatch;
mod server;
mod value;
mod wire;


pub use self::client::EventClient;
pub use self::dispatch::{
    AggregatedResult, DEFAULT_MAX_CONCURRENCY, EventDispatcher, EventTriggerResult, HealthReport,
    TriggerError, TriggerPolicy,
};
#[cfg(test)]
pub(crate) use self::server::MockEventHandler;
pub use self::server::{EventCall, EventHandler, EventServer};
pub use self::value::{EVENT_ENCODING, EventData, EventValue};
pub use self::wire::{
    EVENT_CAPABILITY, REGISTER_METHOD, RegisterParams, TRIGGER_METHOD, TriggerOutcome,
    TriggerParams,
};

/// Log target for event registration and dispatch.
pub(crate) const EVENTS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::events");

/// Event the host sends to every plugin right after it starts.
pub const RPC_INIT_EVENT: &str = "rpc-init";

/// Greeting carried as the first `rpc-init` argument.
pub const RPC_INIT_GREETING: &str = "plugin event triggered from switchboard";

/// Arguments of the `rpc-init` trigger: the greeting followed by 1, 2, 3.
#[must_use]
pub fn rpc_init_data() -> EventData {
    EventData::new()
        .with(RPC_INIT_GREETING)
        .with(1_i64)
        .with(2_i64)
        .with(3_i64)
}
