//! Unit tests for plugin process management.
//!
//! Scripted `/bin/sh` plugins stand in for real plugin binaries: each script
//! prints a handshake line that points at a listener owned by the test, so the
//! test plays the plugin's side of the channel.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rstest::{fixture, rstest};

use super::*;
use crate::handshake::{CORE_PROTOCOL_VERSION, DEFAULT_COOKIE_KEY, DEFAULT_COOKIE_VALUE};
use crate::transport::{Endpoint, EndpointListener};

fn fast_options() -> LaunchOptions {
    LaunchOptions::default()
        .with_startup_timeout(Duration::from_secs(5))
        .with_call_timeout(Duration::from_secs(2))
}

fn handshake_line(endpoint: &Endpoint, cookie_value: &str) -> String {
    HandshakeLine {
        core_version: CORE_PROTOCOL_VERSION,
        protocol_version: 1,
        cookie_key: DEFAULT_COOKIE_KEY.to_owned(),
        cookie_value: cookie_value.to_owned(),
        endpoint: endpoint.to_string(),
        capabilities: vec![String::from("eventplugin")],
        server_cert: None,
    }
    .to_json()
    .expect("serialise handshake")
}

fn script_plugin(name: &str, script: String) -> PluginSpec {
    PluginSpec::new("/bin/sh")
        .with_name(name)
        .with_args([String::from("-c"), script])
}

/// A plugin script that checks its cookie, announces `endpoint`, and idles.
fn announcing_plugin(name: &str, endpoint: &Endpoint) -> PluginSpec {
    let line = handshake_line(endpoint, DEFAULT_COOKIE_VALUE);
    script_plugin(
        name,
        format!(
            r#"[ "${DEFAULT_COOKIE_KEY}" = "{DEFAULT_COOKIE_VALUE}" ] || exit 3; printf '%s\n' '{line}'; exec sleep 30"#
        ),
    )
}

struct FakePeer {
    endpoint: Endpoint,
    accepted: JoinHandle<Channel>,
}

#[fixture]
fn peer() -> FakePeer {
    let listener = EndpointListener::bind(&Endpoint::tcp("127.0.0.1", 0)).expect("bind listener");
    let endpoint = listener.endpoint().clone();
    let accepted = thread::spawn(move || {
        let conduit = listener
            .accept(Duration::from_secs(5))
            .expect("host connects");
        Channel::open(
            "host",
            conduit,
            Arc::new(CapabilitySet::new()),
            ChannelOptions::default(),
        )
        .expect("open peer channel")
    });
    FakePeer { endpoint, accepted }
}

#[rstest]
fn name_defaults_to_file_stem() {
    let spec = PluginSpec::new("/opt/plugins/rpc-events.bin");
    assert_eq!(spec.name(), "rpc-events");
    assert!(spec.args().is_empty());
    assert!(spec.triggers().is_empty());
    assert!(!spec.auto_encrypt());
}

#[rstest]
fn builder_overrides_fields() {
    let spec = PluginSpec::new("/opt/plugins/a")
        .with_name("audit")
        .with_args(["--verbose"])
        .with_triggers(["post-created"])
        .with_auto_encrypt(true);
    assert_eq!(spec.name(), "audit");
    assert_eq!(spec.args(), ["--verbose"]);
    assert_eq!(spec.triggers(), ["post-created"]);
    assert!(spec.auto_encrypt());
}

#[rstest]
#[case::empty_path(PluginSpec::new(""))]
#[case::blank_name(PluginSpec::new("/opt/plugins/a").with_name("  "))]
fn invalid_specs_are_rejected(#[case] spec: PluginSpec) {
    let err = PluginProcess::spawn(&spec, &HandshakeConfig::default(), &fast_options())
        .expect_err("spec must be rejected");
    assert!(matches!(err, PluginError::InvalidSpec { .. }), "{err}");
}

#[rstest]
fn missing_executable_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = PluginSpec::new(dir.path().join("absent-plugin"));
    let err = PluginProcess::spawn(&spec, &HandshakeConfig::default(), &fast_options())
        .expect_err("spawn must fail");
    assert!(
        matches!(&err, PluginError::ExecutableNotFound { name, .. } if name == "absent-plugin"),
        "{err}"
    );
    assert!(err.is_startup_failure());
}

#[rstest]
fn early_exit_is_a_handshake_failure_with_status() {
    let spec = script_plugin("quitter", String::from("echo 'not a plugin host' >&2; exit 1"));
    let err = PluginProcess::spawn(&spec, &HandshakeConfig::default(), &fast_options())
        .expect_err("spawn must fail");
    assert!(
        matches!(
            err,
            PluginError::Handshake {
                source: HandshakeError::Closed { status: Some(1) },
                ..
            }
        ),
        "{err}"
    );
}

#[rstest]
fn wrong_cookie_echo_is_rejected(peer: FakePeer) {
    let line = handshake_line(&peer.endpoint, "forged");
    let spec = script_plugin("forger", format!("printf '%s\\n' '{line}'; exec sleep 30"));
    let err = PluginProcess::spawn(&spec, &HandshakeConfig::default(), &fast_options())
        .expect_err("spawn must fail");
    assert!(
        matches!(
            err,
            PluginError::Handshake {
                source: HandshakeError::CookieValueMismatch { .. },
                ..
            }
        ),
        "{err}"
    );
    drop(peer);
}

#[rstest]
fn mismatched_host_cookie_makes_plugin_refuse(peer: FakePeer) {
    let spec = announcing_plugin("picky", &peer.endpoint);
    let config = HandshakeConfig::new(1, DEFAULT_COOKIE_KEY, "other-secret");
    let err = PluginProcess::spawn(&spec, &config, &fast_options()).expect_err("spawn must fail");
    assert!(
        matches!(
            err,
            PluginError::Handshake {
                source: HandshakeError::Closed { status: Some(3) },
                ..
            }
        ),
        "{err}"
    );
}

#[rstest]
fn silent_plugin_times_out() {
    let spec = script_plugin("sleeper", String::from("exec sleep 30"));
    let options = fast_options().with_startup_timeout(Duration::from_millis(200));
    let err = PluginProcess::spawn(&spec, &HandshakeConfig::default(), &options)
        .expect_err("spawn must fail");
    assert!(
        matches!(
            err,
            PluginError::Handshake {
                source: HandshakeError::Timeout { timeout_ms: 200 },
                ..
            }
        ),
        "{err}"
    );
}

#[rstest]
fn garbage_handshake_is_malformed() {
    let spec = script_plugin("noisy", String::from("echo hello; exec sleep 30"));
    let err = PluginProcess::spawn(&spec, &HandshakeConfig::default(), &fast_options())
        .expect_err("spawn must fail");
    assert!(
        matches!(
            err,
            PluginError::Handshake {
                source: HandshakeError::Malformed { .. },
                ..
            }
        ),
        "{err}"
    );
}

#[rstest]
fn endless_handshake_line_is_malformed() {
    let spec = script_plugin(
        "chatty",
        String::from("head -c 10000 /dev/zero | tr '\\0' x; exec sleep 30"),
    );
    let err = PluginProcess::spawn(&spec, &HandshakeConfig::default(), &fast_options())
        .expect_err("spawn must fail");
    assert!(
        matches!(
            &err,
            PluginError::Handshake {
                source: HandshakeError::Malformed { message },
                ..
            } if message.contains("exceeds")
        ),
        "{err}"
    );
}

#[rstest]
fn encryption_requires_a_server_certificate(peer: FakePeer) {
    let spec = announcing_plugin("plain", &peer.endpoint).with_auto_encrypt(true);
    let err = PluginProcess::spawn(&spec, &HandshakeConfig::default(), &fast_options())
        .expect_err("spawn must fail");
    assert!(
        matches!(
            err,
            PluginError::Handshake {
                source: HandshakeError::EncryptionRequired,
                ..
            }
        ),
        "{err}"
    );
}

#[rstest]
fn unreachable_endpoint_is_a_connect_error() {
    let listener = EndpointListener::bind(&Endpoint::tcp("127.0.0.1", 0)).expect("bind");
    let endpoint = listener.endpoint().clone();
    drop(listener);
    let spec = announcing_plugin("ghost", &endpoint);
    let err = PluginProcess::spawn(&spec, &HandshakeConfig::default(), &fast_options())
        .expect_err("spawn must fail");
    assert!(matches!(err, PluginError::Connect { .. }), "{err}");
}

#[rstest]
fn spawn_completes_handshake_and_ping(peer: FakePeer) {
    let spec = announcing_plugin("scripted", &peer.endpoint);
    let process = PluginProcess::spawn(&spec, &HandshakeConfig::default(), &fast_options())
        .expect("spawn succeeds");
    let plugin_side = peer.accepted.join().expect("peer thread");

    assert_eq!(process.name(), "scripted");
    assert_eq!(process.protocol_version(), 1);
    assert_eq!(process.capabilities(), ["eventplugin"]);
    assert!(!process.is_encrypted());
    assert!(process.pid() > 0);
    assert!(process.is_alive());
    assert!(process.exit_status().is_none());
    process
        .channel()
        .ping(Duration::from_secs(1))
        .expect("ping over the channel");

    process.kill();
    assert!(plugin_side.ping(Duration::from_millis(500)).is_err());
}

#[rstest]
fn kill_is_idempotent(peer: FakePeer) {
    let spec = announcing_plugin("twice", &peer.endpoint);
    let process = PluginProcess::spawn(&spec, &HandshakeConfig::default(), &fast_options())
        .expect("spawn succeeds");
    let _plugin_side = peer.accepted.join().expect("peer thread");

    process.kill();
    let first = process.exit_status();
    process.kill();

    assert!(!process.is_alive());
    assert!(process.channel().is_closed());
    assert!(first.is_some());
    assert_eq!(process.exit_status(), first);
}

#[rstest]
fn status_queries_do_not_wait_for_a_lingering_child(peer: FakePeer) {
    let spec = announcing_plugin("lingering", &peer.endpoint);
    let process = Arc::new(
        PluginProcess::spawn(&spec, &HandshakeConfig::default(), &fast_options())
            .expect("spawn succeeds"),
    );
    let _plugin_side = peer.accepted.join().expect("peer thread");

    let killer = {
        let process = Arc::clone(&process);
        thread::spawn(move || process.kill())
    };
    let deadline = Instant::now() + Duration::from_secs(2);
    while !process.channel().is_closed() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    let started = Instant::now();
    assert!(!process.is_alive());
    process.kill();
    let waited = started.elapsed();
    assert!(waited < Duration::from_millis(100), "blocked for {waited:?}");

    killer.join().expect("kill thread");
    assert!(process.exit_status().is_some());
}

#[rstest]
fn closed_channel_marks_plugin_dead(peer: FakePeer) {
    let spec = announcing_plugin("fragile", &peer.endpoint);
    let process = PluginProcess::spawn(&spec, &HandshakeConfig::default(), &fast_options())
        .expect("spawn succeeds");
    let plugin_side = peer.accepted.join().expect("peer thread");

    plugin_side.close();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while process.is_alive() && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }

    assert!(!process.is_alive());
    let err = process
        .channel()
        .call("eventplugin.trigger", serde_json::Value::Null, Duration::from_secs(1))
        .expect_err("channel is closed");
    assert!(err.is_transport_failure());
}

#[rstest]
fn dispenser_is_bound_to_the_plugin(peer: FakePeer) {
    let spec = announcing_plugin("lender", &peer.endpoint);
    let process = PluginProcess::spawn(&spec, &HandshakeConfig::default(), &fast_options())
        .expect("spawn succeeds");
    let _plugin_side = peer.accepted.join().expect("peer thread");

    let err = process
        .dispenser(Duration::from_secs(1))
        .dispense("eventplugin")
        .expect_err("the fake peer exports nothing");
    assert!(
        matches!(&err, PluginError::CapabilityNotExported { name, capability } if name == "lender" && capability == "eventplugin"),
        "{err}"
    );
}
