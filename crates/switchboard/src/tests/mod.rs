//! Crate-level integration and BDD tests.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::capability::{CapabilitySet, Dispenser, HOST_CAPABILITY, HostCapability, HostClient};
use crate::events::{
    EventData, EventDispatcher, EventHandler, EventServer, TriggerOutcome, TriggerPolicy,
};
use crate::registry::{PluginHandle, PluginRegistry};
use crate::test_support::channel_pair;


const TIMEOUT: Duration = Duration::from_secs(5);

/// Handles an event only when a call back into the host succeeds.
struct CallsHome {
    host: Arc<OnceLock<HostClient>>,
}

impl EventHandler for CallsHome {
    fn register(&self, _triggers: &[String]) {}

    fn trigger(&self, _event: &str, _args: &EventData) -> TriggerOutcome {
        match self.host.get().map(HostClient::ping) {
            Some(Ok(())) => TriggerOutcome::handled(),
            Some(Err(err)) => TriggerOutcome::failed(err.to_string()),
            None => TriggerOutcome::failed("host capability not dispensed"),
        }
    }
}

#[test]
fn plugin_calls_back_into_the_host_during_a_trigger() {
    let host_slot = Arc::new(OnceLock::new());
    let pair = channel_pair(
        "caller",
        CapabilitySet::new().with(HostCapability),
        CapabilitySet::new().with(EventServer::new(CallsHome {
            host: Arc::clone(&host_slot),
        })),
    )
    .expect("channel pair");
    let stub = Dispenser::new("host", pair.plugin.clone(), TIMEOUT)
        .dispense(HOST_CAPABILITY)
        .expect("host exports its capability");
    host_slot
        .set(HostClient::new(stub, TIMEOUT))
        .expect("slot starts empty");

    let registry = Arc::new(PluginRegistry::new());
    registry
        .insert(PluginHandle::attach("caller", pair.host.clone(), TIMEOUT).expect("attach"))
        .expect("insert");
    let dispatcher = EventDispatcher::new(registry, TriggerPolicy::default());

    let result = dispatcher.trigger("post-created", &EventData::new());

    assert!(result.handled, "{:?}", result.errors);
    assert!(result.errors.is_empty());
}
