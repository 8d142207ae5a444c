//! Unit tests for the host runtime.

use std::ffi::OsString;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use switchboard::EventValue;
use switchboard_config::{Config, LogFormat, PluginConfig};
use tempfile::TempDir;

use super::*;
use crate::telemetry::general_directives;

/// Scratch directory holding an empty configuration file.
struct Workspace {
    _dir: TempDir,
    config: Utf8PathBuf,
}

#[fixture]
fn workspace() -> Workspace {
    let dir = TempDir::new().expect("temp dir");
    let config = Utf8PathBuf::from_path_buf(dir.path().join("switchboard.toml"))
        .expect("utf-8 temp path");
    fs::write(&config, "").expect("write config");
    Workspace { _dir: dir, config }
}

fn args(items: &[&str]) -> Vec<OsString> {
    items.iter().map(OsString::from).collect()
}

fn parse(items: &[&str]) -> Cli {
    Cli::try_parse_from(args(items)).expect("valid command line")
}

fn load_config(workspace: &Workspace, text: &str, flags: &[&str]) -> Result<Config, ConfigError> {
    fs::write(&workspace.config, text).expect("write config");
    let mut items = vec!["switchboard", "--config-path", workspace.config.as_str()];
    items.extend_from_slice(flags);
    config::load(&args(&items))
}

fn run_captured(items: &[&str]) -> (ExitCode, String, String) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let code = run(args(items), &mut stdout, &mut stderr);
    (
        code,
        String::from_utf8(stdout).expect("utf-8 stdout"),
        String::from_utf8(stderr).expect("utf-8 stderr"),
    )
}

#[rstest]
#[case("null", EventValue::Null)]
#[case("true", EventValue::Bool(true))]
#[case("false", EventValue::Bool(false))]
#[case("42", EventValue::Int(42))]
#[case("-7", EventValue::Int(-7))]
#[case("2.5", EventValue::Float(2.5))]
#[case("hello", EventValue::String(String::from("hello")))]
#[case("NaN", EventValue::String(String::from("NaN")))]
fn event_arguments_are_typed(#[case] text: &str, #[case] expected: EventValue) {
    assert_eq!(parse_event_arg(text), expected);
}

#[rstest]
fn trigger_keeps_hyphenated_arguments() {
    let cli = parse(&["switchboard", "trigger", "post-created", "-1", "--draft"]);
    let Command::Trigger { event, arguments } = cli.command else {
        panic!("expected trigger");
    };
    assert_eq!(event, "post-created");
    assert_eq!(arguments, ["-1", "--draft"]);
}

#[rstest]
fn flags_override_the_loaded_configuration(workspace: Workspace) {
    let config = load_config(
        &workspace,
        "log_filter = \"warn\"\n",
        &[
            "--log-filter",
            "debug",
            "--log-format",
            "compact",
            "--plugin-log",
            "/tmp/plugins.log",
            "--plugins",
            "/opt/plugins/audit",
        ],
    )
    .expect("valid overrides");
    assert_eq!(config.log_filter(), "debug");
    assert_eq!(config.log_format(), LogFormat::Compact);
    assert_eq!(
        config.plugin_log().map(Utf8Path::as_str),
        Some("/tmp/plugins.log")
    );
    let names: Vec<&str> = config.plugins.iter().map(PluginConfig::display_name).collect();
    assert_eq!(names, ["audit"]);
}

#[rstest]
fn duplicate_plugins_from_flags_are_rejected(workspace: Workspace) {
    let err = load_config(
        &workspace,
        "",
        &["--plugins", "/opt/a/audit", "--plugins", "/opt/b/audit"],
    )
    .expect_err("names clash");
    assert!(matches!(err, ConfigError::Invalid { .. }), "{err}");
}

#[rstest]
fn plugin_log_target_is_muted_only_when_it_has_a_file() {
    let mut config = Config::default();
    assert_eq!(general_directives(&config), "info");

    config.plugin_log = Some(Utf8PathBuf::from("/tmp/plugins.log"));
    assert_eq!(
        general_directives(&config),
        "info,switchboard::plugin_log=off"
    );

    config.log_filter = String::new();
    assert_eq!(general_directives(&config), "switchboard::plugin_log=off");
}

#[rstest]
fn help_goes_to_stdout_and_succeeds() {
    let (code, stdout, stderr) = run_captured(&["switchboard", "--help"]);
    assert_eq!(code, ExitCode::SUCCESS);
    assert!(stdout.contains("trigger"), "{stdout}");
    assert!(stdout.contains("--config-path"), "{stdout}");
    assert!(stderr.is_empty());
}

#[rstest]
fn missing_subcommand_is_a_usage_error() {
    let (code, stdout, stderr) = run_captured(&["switchboard"]);
    assert_eq!(code, ExitCode::from(2));
    assert!(stdout.is_empty());
    assert!(stderr.contains("Usage"), "{stderr}");
}

#[rstest]
fn trigger_without_plugins_prints_a_neutral_result(workspace: Workspace) {
    let (code, stdout, stderr) = run_captured(&[
        "switchboard",
        "--config-path",
        workspace.config.as_str(),
        "trigger",
        "post-created",
        "42",
    ]);
    assert_eq!(code, ExitCode::SUCCESS, "{stderr}");
    let printed: serde_json::Value = serde_json::from_str(&stdout).expect("json output");
    assert_eq!(printed["handled"], false);
    assert_eq!(printed["recovered"], false);
    assert_eq!(printed["errors"], serde_json::json!([]));
}

#[rstest]
fn check_reports_plugins_that_fail_to_start(workspace: Workspace) {
    let missing = workspace.config.with_file_name("no-such-plugin");
    let (code, stdout, _stderr) = run_captured(&[
        "switchboard",
        "--config-path",
        workspace.config.as_str(),
        "--plugins",
        missing.as_str(),
        "check",
    ]);
    assert_eq!(code, ExitCode::FAILURE);
    let printed: serde_json::Value = serde_json::from_str(&stdout).expect("json output");
    assert_eq!(printed["started"], serde_json::json!([]));
    assert_eq!(printed["failed"][0]["plugin"], "no-such-plugin");
}

#[rstest]
fn unreadable_configuration_fails_before_starting(workspace: Workspace) {
    let absent = workspace.config.with_file_name("absent.toml");
    let (code, stdout, stderr) = run_captured(&[
        "switchboard",
        "--config-path",
        absent.as_str(),
        "check",
    ]);
    assert_eq!(code, ExitCode::FAILURE);
    assert!(stdout.is_empty());
    assert!(stderr.contains("failed to load configuration"), "{stderr}");
}

#[rstest]
fn configured_plugins_become_specs(workspace: Workspace) {
    let config = load_config(
        &workspace,
        r#"
        cookie_value = "s3cret"
        call_timeout_ms = 250
        max_concurrency = 2
        filter_by_registration = true

        [[plugins]]
        path = "/opt/plugins/audit"
        name = "auditor"
        args = ["--verbose"]
        events = ["post-created"]
        auto_encrypt = true
        "#,
        &[],
    )
    .expect("valid configuration");

    let specs = bootstrap::plugin_specs(&config);
    let [spec] = specs.as_slice() else {
        panic!("expected one spec, got {}", specs.len());
    };
    assert_eq!(spec.name(), "auditor");
    assert_eq!(spec.args(), ["--verbose"]);
    assert_eq!(spec.triggers(), ["post-created"]);
    assert!(spec.auto_encrypt());

    assert_eq!(bootstrap::handshake(&config).cookie_value(), "s3cret");
    let policy = bootstrap::trigger_policy(&config);
    assert_eq!(policy.call_timeout(), std::time::Duration::from_millis(250));
    assert_eq!(bootstrap::launch_options(&config).call_timeout(), policy.call_timeout());
}
