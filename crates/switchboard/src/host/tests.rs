//! Unit tests for the plugin host bootstrap.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::capability::CapabilitySet;
use crate::events::{EventHandler, EventServer, EventValue, RPC_INIT_GREETING, TriggerOutcome};
use crate::handshake::{CORE_PROTOCOL_VERSION, DEFAULT_COOKIE_VALUE, HandshakeLine};
use crate::transport::{Channel, ChannelOptions, Endpoint, EndpointListener};

#[derive(Debug, Default, Clone)]
struct Recorder {
    registered: Arc<Mutex<Vec<String>>>,
    seen: Arc<Mutex<Vec<(String, EventData)>>>,
}

impl Recorder {
    fn registered(&self) -> Vec<String> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn seen(&self) -> Vec<(String, EventData)> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl EventHandler for Recorder {
    fn register(&self, triggers: &[String]) {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(triggers.iter().cloned());
    }

    fn trigger(&self, event: &str, args: &EventData) -> TriggerOutcome {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((event.to_owned(), args.clone()));
        TriggerOutcome::handled()
    }
}

/// Listener playing the plugin side of one scripted plugin.
struct EventPeer {
    endpoint: Endpoint,
    recorder: Recorder,
    accepted: JoinHandle<Channel>,
}

impl EventPeer {
    fn spec(&self, name: &str) -> PluginSpec {
        let line = HandshakeLine {
            core_version: CORE_PROTOCOL_VERSION,
            protocol_version: 1,
            cookie_key: crate::handshake::DEFAULT_COOKIE_KEY.to_owned(),
            cookie_value: DEFAULT_COOKIE_VALUE.to_owned(),
            endpoint: self.endpoint.to_string(),
            capabilities: vec![String::from("eventplugin")],
            server_cert: None,
        }
        .to_json()
        .expect("serialise handshake");
        PluginSpec::new("/bin/sh").with_name(name).with_args([
            String::from("-c"),
            format!("printf '%s\\n' '{line}'; exec sleep 30"),
        ])
    }
}

#[fixture]
fn peer() -> EventPeer {
    let listener = EndpointListener::bind(&Endpoint::tcp("127.0.0.1", 0)).expect("bind listener");
    let endpoint = listener.endpoint().clone();
    let recorder = Recorder::default();
    let served = recorder.clone();
    let accepted = thread::spawn(move || {
        let conduit = listener
            .accept(Duration::from_secs(5))
            .expect("host connects");
        Channel::open(
            "host",
            conduit,
            Arc::new(CapabilitySet::new().with(EventServer::new(served))),
            ChannelOptions::default(),
        )
        .expect("open plugin channel")
    });
    EventPeer {
        endpoint,
        recorder,
        accepted,
    }
}

fn host() -> PluginHost {
    PluginHost::new(
        HandshakeConfig::default(),
        LaunchOptions::default()
            .with_startup_timeout(Duration::from_secs(5))
            .with_call_timeout(Duration::from_secs(2)),
        TriggerPolicy::default(),
    )
}

#[rstest]
fn host_without_plugins_dispatches_nothing() {
    let host = host();
    let report = host.start_all(&[]);
    assert!(report.started.is_empty());
    assert!(report.failed.is_empty());

    let result = host.trigger("post-created", &EventData::new());
    assert!(!result.handled);
    assert!(!result.recovered);
    assert!(result.errors.is_empty());
    assert!(result.results.is_empty());
}

#[rstest]
fn missing_plugins_are_left_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let host = host();
    let report = host.start_all(&[PluginSpec::new(dir.path().join("absent"))]);

    assert!(report.started.is_empty());
    let failure = report.failed.first().expect("one failure");
    assert_eq!(failure.plugin, "absent");
    assert!(matches!(failure.error, PluginError::ExecutableNotFound { .. }));
    assert!(host.registry().is_empty());
}

#[rstest]
fn start_registers_triggers_and_sends_rpc_init(peer: EventPeer) {
    let host = host();
    let spec = peer.spec("audit").with_triggers(["post-created", "post-deleted"]);
    let handle = host.start(&spec).expect("plugin starts");
    let _plugin_side = peer.accepted.join().expect("peer thread");

    assert_eq!(handle.name(), "audit");
    assert_eq!(host.registry().names(), ["audit"]);
    assert_eq!(peer.recorder.registered(), ["post-created", "post-deleted"]);
    assert!(handle.is_subscribed("post-deleted"));

    let seen = peer.recorder.seen();
    let (event, args) = seen.first().expect("rpc-init delivered");
    assert_eq!(event, RPC_INIT_EVENT);
    assert_eq!(args.get(0), Some(&EventValue::from(RPC_INIT_GREETING)));
    assert_eq!(args.len(), 4);
}

#[rstest]
fn started_plugins_receive_triggers(peer: EventPeer) {
    let dir = tempfile::tempdir().expect("tempdir");
    let host = host();
    let report = host.start_all(&[PluginSpec::new(dir.path().join("absent")), peer.spec("audit")]);
    let _plugin_side = peer.accepted.join().expect("peer thread");

    assert_eq!(report.started, ["audit"]);
    assert_eq!(report.failed.len(), 1);

    let result = host.trigger("post-created", &EventData::new().with("hello"));
    assert!(result.handled);
    assert!(result.errors.is_empty());
    assert!(result.result_for("audit").is_some_and(|r| r.handled));
}

#[rstest]
fn shutdown_is_idempotent(peer: EventPeer) {
    let host = host();
    let handle = host.start(&peer.spec("audit")).expect("plugin starts");
    let _plugin_side = peer.accepted.join().expect("peer thread");

    host.shutdown();
    host.shutdown();

    assert!(host.registry().is_empty());
    assert!(!handle.is_alive());
    assert!(handle.process().is_some_and(|process| process.exit_status().is_some()));
}
