//! Unit tests for the reference plugin.

use std::panic::{self, AssertUnwindSafe};

use rstest::rstest;
use switchboard::events::{EventValue, rpc_init_data};
use switchboard::handshake::{DEFAULT_COOKIE_KEY, DEFAULT_COOKIE_VALUE, HandshakeError};
use switchboard::serve::serve_with;

use super::*;

fn post() -> EventData {
    EventData::new().with(42_i64).with("draft")
}

#[rstest]
#[case("log", Behaviour::Log)]
#[case("handled", Behaviour::Handled)]
#[case("echo", Behaviour::Echo)]
#[case("wrong-cookie", Behaviour::WrongCookie)]
fn behaviours_parse_from_kebab_case(#[case] text: &str, #[case] expected: Behaviour) {
    assert_eq!(text.parse::<Behaviour>().expect("known behaviour"), expected);
    assert_eq!(expected.to_string(), text);
}

#[rstest]
fn arguments_select_the_behaviour() {
    let args = PluginArgs::try_parse_from(["plugin", "--behaviour", "panic"]).expect("valid");
    assert_eq!(args.behaviour, Behaviour::Panic);
    let defaults = PluginArgs::try_parse_from(["plugin"]).expect("valid");
    assert_eq!(defaults.behaviour, Behaviour::Log);
    assert_eq!(defaults.log_filter, "info");
}

#[rstest]
#[case(Behaviour::Log, false, None)]
#[case(Behaviour::Handled, true, None)]
#[case(Behaviour::Fail, false, Some("refused to handle post-created"))]
fn outcomes_follow_the_behaviour(
    #[case] behaviour: Behaviour,
    #[case] handled: bool,
    #[case] error: Option<&str>,
) {
    let outcome = ReferencePlugin::new(behaviour).trigger("post-created", &post());
    assert_eq!(outcome.handled, handled);
    assert_eq!(outcome.error.as_deref(), error);
    assert!(!outcome.recovered);
    assert!(outcome.reply.is_empty());
}

#[rstest]
fn echo_replies_with_the_arguments() {
    let outcome = ReferencePlugin::new(Behaviour::Echo).trigger("post-created", &post());
    assert!(outcome.handled);
    assert_eq!(outcome.reply.get(0), Some(&EventValue::Int(42)));
    assert_eq!(outcome.reply, post());
}

#[rstest]
fn panic_behaviour_panics_in_the_handler() {
    let plugin = ReferencePlugin::new(Behaviour::Panic);
    let result = panic::catch_unwind(AssertUnwindSafe(|| plugin.trigger("post-created", &post())));
    assert!(result.is_err());
}

#[rstest]
#[case(Behaviour::Panic)]
#[case(Behaviour::Exit)]
#[case(Behaviour::Hang)]
fn rpc_init_is_acknowledged_whatever_the_behaviour(#[case] behaviour: Behaviour) {
    let outcome = ReferencePlugin::new(behaviour).trigger(RPC_INIT_EVENT, &rpc_init_data());
    assert!(outcome.handled);
    assert!(outcome.error.is_none());
}

#[rstest]
fn register_records_the_triggers() {
    let plugin = ReferencePlugin::default();
    assert!(plugin.registered().is_empty());
    plugin.register(&[String::from("post-created"), String::from("post-deleted")]);
    assert_eq!(plugin.registered(), ["post-created", "post-deleted"]);
}

#[rstest]
fn wrong_cookie_behaviour_rejects_the_host_cookie() {
    let mut announced = Vec::new();
    let err = serve_with(
        serve_config(Behaviour::WrongCookie),
        |key| (key == DEFAULT_COOKIE_KEY).then(|| DEFAULT_COOKIE_VALUE.to_owned()),
        &mut announced,
    )
    .expect_err("cookie differs");
    assert!(err.is_cookie_failure());
    assert!(announced.is_empty());
}

#[rstest]
fn cookie_failures_print_the_plugin_notice() {
    let mut stderr = Vec::new();
    let err = ServeError::Handshake(HandshakeError::MissingCookie {
        key: DEFAULT_COOKIE_KEY.to_owned(),
    });
    assert_eq!(report(&err, &mut stderr), ExitCode::FAILURE);
    let printed = String::from_utf8(stderr).expect("utf-8");
    assert!(printed.starts_with("This binary is a Switchboard plugin."), "{printed}");
}

#[rstest]
fn unknown_behaviour_is_a_usage_error() {
    let mut stderr = Vec::new();
    let code = run(
        ["plugin", "--behaviour", "sulk"].map(OsString::from),
        &mut stderr,
    );
    assert_eq!(code, ExitCode::from(2));
    assert!(!stderr.is_empty());
}
