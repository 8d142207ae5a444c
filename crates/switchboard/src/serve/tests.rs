//! Unit tests for the plugin-side serve loop.

use std::collections::HashMap;
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use rstest::rstest;

use super::*;
use crate::capability::Dispenser;
use crate::events::{EventClient, EventData, TriggerOutcome};
use crate::handshake::{DEFAULT_COOKIE_KEY, DEFAULT_COOKIE_VALUE, HandshakeExpectation};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Handled;

impl EventHandler for Handled {
    fn register(&self, _triggers: &[String]) {}

    fn trigger(&self, _event: &str, args: &EventData) -> TriggerOutcome {
        TriggerOutcome::handled().with_reply(args.clone())
    }
}

/// Forwards everything written to it, so the test can read the handshake
/// line while `serve_with` is still blocked in accept.
struct Announce(Sender<Vec<u8>>);

impl Write for Announce {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn read_line(chunks: &Receiver<Vec<u8>>) -> HandshakeLine {
    let mut bytes = Vec::new();
    while !bytes.contains(&b'\n') {
        let chunk = chunks.recv_timeout(TIMEOUT).expect("handshake line");
        bytes.extend(chunk);
    }
    HandshakeLine::parse(&String::from_utf8_lossy(&bytes)).expect("valid handshake line")
}

fn host_env() -> HashMap<String, String> {
    HashMap::from([
        (DEFAULT_COOKIE_KEY.to_owned(), DEFAULT_COOKIE_VALUE.to_owned()),
        (PROTOCOL_VERSIONS_ENV.to_owned(), String::from("1")),
    ])
}

fn spawn_serve(
    config: ServeConfig,
    env: HashMap<String, String>,
) -> (Receiver<Vec<u8>>, JoinHandle<Result<(), ServeError>>) {
    let (sender, chunks) = mpsc::channel();
    let served =
        thread::spawn(move || serve_with(config, |key| env.get(key).cloned(), Announce(sender)));
    (chunks, served)
}

#[rstest]
fn missing_cookie_stops_before_announcing() {
    let mut out = Vec::new();
    let err = serve_with(ServeConfig::events("p", Handled), |_| None, &mut out)
        .expect_err("cookie is required");
    assert!(matches!(
        err,
        ServeError::Handshake(HandshakeError::MissingCookie { .. })
    ));
    assert!(err.is_cookie_failure());
    assert!(out.is_empty());
}

#[rstest]
fn wrong_cookie_is_rejected() {
    let mut out = Vec::new();
    let err = serve_with(
        ServeConfig::events("p", Handled),
        |key| (key == DEFAULT_COOKIE_KEY).then(|| String::from("forged")),
        &mut out,
    )
    .expect_err("cookie must match");
    assert!(err.is_cookie_failure());
    assert!(out.is_empty());
}

#[rstest]
fn unsupported_versions_are_refused() {
    let mut env = host_env();
    env.insert(PROTOCOL_VERSIONS_ENV.to_owned(), String::from("2,3"));
    let mut out = Vec::new();
    let err = serve_with(
        ServeConfig::events("p", Handled),
        |key| env.get(key).cloned(),
        &mut out,
    )
    .expect_err("no shared version");
    assert!(
        matches!(&err, ServeError::Handshake(HandshakeError::NoCommonVersion { offered, supported }) if offered == "2,3" && supported == "1"),
        "{err}"
    );
    assert!(!err.is_cookie_failure());
}

#[rstest]
fn host_that_never_connects_times_out() {
    let env = host_env();
    let mut out = Vec::new();
    let config =
        ServeConfig::events("p", Handled).with_accept_timeout(Duration::from_millis(100));
    let err = serve_with(config, |key| env.get(key).cloned(), &mut out)
        .expect_err("nobody connects");
    assert!(matches!(err, ServeError::Io { .. }), "{err}");
    let line = HandshakeLine::parse(&String::from_utf8_lossy(&out)).expect("line was announced");
    assert_eq!(line.capabilities, ["eventplugin"]);
}

#[rstest]
fn serves_events_until_the_host_disconnects() {
    let (chunks, served) = spawn_serve(ServeConfig::events("echoer", Handled), host_env());
    let line = read_line(&chunks);
    HandshakeExpectation::new(&HandshakeConfig::default(), false)
        .validate(&line)
        .expect("handshake accepted");
    assert_eq!(line.protocol_version, 1);
    assert!(line.server_cert.is_none());

    let conduit = line
        .endpoint()
        .expect("endpoint")
        .connect(TIMEOUT)
        .expect("connect");
    let channel = Channel::open(
        "echoer",
        conduit,
        Arc::new(CapabilitySet::new()),
        ChannelOptions::default(),
    )
    .expect("open channel");
    let events =
        EventClient::dispense(&Dispenser::new("echoer", channel.clone(), TIMEOUT)).expect("dispense");
    let data = EventData::new().with(42_i64);
    let outcome = events.trigger("post-created", &data, TIMEOUT).expect("trigger");
    assert!(outcome.handled);
    assert_eq!(outcome.reply, data);

    channel.close();
    served.join().expect("serve thread").expect("clean exit");
}

#[rstest]
fn encrypts_when_the_host_sends_a_certificate() {
    let identity = SessionIdentity::generate().expect("host identity");
    let mut env = host_env();
    env.insert(CLIENT_CERT_ENV.to_owned(), identity.certificate_base64());
    let (chunks, served) = spawn_serve(ServeConfig::events("sealed", Handled), env);

    let line = read_line(&chunks);
    HandshakeExpectation::new(&HandshakeConfig::default(), true)
        .validate(&line)
        .expect("handshake carries a certificate");
    let server_cert =
        tls::decode_certificate(line.server_cert.as_deref().expect("server cert")).expect("decode");
    let plain = line
        .endpoint()
        .expect("endpoint")
        .connect(TIMEOUT)
        .expect("connect");
    let sealed = tls::connect(plain, &identity, &server_cert, TIMEOUT).expect("tls handshake");
    let channel = Channel::open(
        "sealed",
        Box::new(sealed),
        Arc::new(CapabilitySet::new()),
        ChannelOptions::default(),
    )
    .expect("open channel");
    channel.ping(TIMEOUT).expect("ping over tls");

    channel.close();
    served.join().expect("serve thread").expect("clean exit");
}
