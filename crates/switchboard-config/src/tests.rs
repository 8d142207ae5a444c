//! Unit tests for configuration loading and validation.

use std::ffi::OsString;
use std::fs;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;

#[fixture]
fn dir() -> TempDir {
    TempDir::new().expect("tempdir")
}

fn load(dir: &TempDir, text: &str, flags: &[&str]) -> Result<Config, ConfigError> {
    let path = dir.path().join("switchboard.toml");
    fs::write(&path, text).expect("write configuration");
    let mut args = vec![
        OsString::from("switchboard"),
        OsString::from("--config-path"),
        path.into_os_string(),
    ];
    args.extend(flags.iter().map(OsString::from));
    Config::load_validated(args)
}

#[rstest]
fn defaults_are_usable() {
    let config = Config::default();
    config.validate().expect("defaults validate");
    assert_eq!(config.log_filter(), default_log_filter());
    assert_eq!(config.log_format(), default_log_format());
    assert_eq!(config.cookie_key, DEFAULT_COOKIE_KEY);
    assert_eq!(config.call_timeout(), DEFAULT_CALL_TIMEOUT);
    assert_eq!(config.startup_timeout(), DEFAULT_STARTUP_TIMEOUT);
    assert!(!config.filter_by_registration);
    assert!(config.plugin_log().is_none());
    assert!(config.plugins.is_empty());
}

#[rstest]
fn loads_a_full_file(dir: TempDir) {
    let config = load(
        &dir,
        r#"
        cookie_key = "BOARD_COOKIE"
        cookie_value = "s3cret"
        call_timeout_ms = 250
        max_concurrency = 2
        filter_by_registration = true
        log_format = "compact"
        plugin_log = "/var/log/switchboard/plugins.log"

        [[plugins]]
        path = "/opt/plugins/audit"
        args = ["--verbose"]
        events = ["post-created", "post-deleted"]
        auto_encrypt = true

        [[plugins]]
        path = "/opt/plugins/notify"
        name = "mailer"
        "#,
        &[],
    )
    .expect("valid configuration");

    assert_eq!(config.cookie_key, "BOARD_COOKIE");
    assert_eq!(config.protocol_version, DEFAULT_PROTOCOL_VERSION);
    assert_eq!(config.call_timeout(), Duration::from_millis(250));
    assert_eq!(config.max_concurrency, 2);
    assert_eq!(config.log_format(), LogFormat::Compact);
    assert_eq!(
        config.plugin_log(),
        Some(Utf8Path::new("/var/log/switchboard/plugins.log"))
    );
    let names: Vec<&str> = config.plugins.iter().map(PluginConfig::display_name).collect();
    assert_eq!(names, ["audit", "mailer"]);
    let audit = config.plugins.first().expect("first plugin");
    assert_eq!(audit.args, ["--verbose"]);
    assert_eq!(audit.events, ["post-created", "post-deleted"]);
    assert!(audit.auto_encrypt);
}

#[rstest]
fn flags_override_the_file(dir: TempDir) {
    let config = load(
        &dir,
        "log_filter = \"warn\"\ncall_timeout_ms = 250\n",
        &["--log-filter", "switchboard=trace", "--call-timeout-ms", "75"],
    )
    .expect("load");
    assert_eq!(config.log_filter(), "switchboard=trace");
    assert_eq!(config.call_timeout(), Duration::from_millis(75));
}

#[rstest]
fn plugin_flag_adds_a_plugin_by_path(dir: TempDir) {
    let config = load(&dir, "", &["--plugins", "/opt/plugins/audit"]).expect("load");
    let names: Vec<&str> = config.plugins.iter().map(PluginConfig::display_name).collect();
    assert_eq!(names, ["audit"]);
}

#[rstest]
#[case::bad_type("call_timeout_ms = \"soon\"")]
#[case::missing_path("[[plugins]]\nargs = []")]
#[case::unknown_format("log_format = \"xml\"")]
#[case::broken_syntax("log_filter = ")]
fn malformed_files_fail_to_load(dir: TempDir, #[case] text: &str) {
    let err = load(&dir, text, &[]).expect_err("must fail");
    assert!(matches!(err, ConfigError::Load(_)), "{err}");
}

#[rstest]
#[case::zero_call_timeout("call_timeout_ms = 0", "call_timeout_ms")]
#[case::zero_startup_timeout("startup_timeout_ms = 0", "startup_timeout_ms")]
#[case::zero_concurrency("max_concurrency = 0", "max_concurrency")]
#[case::empty_cookie("cookie_value = \"\"", "cookie_value")]
#[case::empty_plugin_path("[[plugins]]\npath = \"\"", "plugins[0].path")]
#[case::duplicate_names(
    "[[plugins]]\npath = \"/a/audit\"\n[[plugins]]\npath = \"/b/audit\"",
    "reuses the name 'audit'"
)]
fn out_of_range_settings_are_rejected(
    dir: TempDir,
    #[case] text: &str,
    #[case] fragment: &str,
) {
    let err = load(&dir, text, &[]).expect_err("must fail");
    assert!(matches!(err, ConfigError::Invalid { .. }), "{err}");
    assert!(err.to_string().contains(fragment), "{err}");
}

#[rstest]
fn empty_plugin_log_disables_the_file() {
    let config = Config {
        plugin_log: Some(Utf8PathBuf::from("")),
        ..Config::default()
    };
    assert!(config.plugin_log().is_none());
}

#[rstest]
fn plugin_entries_parse_from_a_bare_path() {
    let plugin: PluginConfig = "/opt/plugins/audit".parse().expect("infallible");
    assert_eq!(plugin, PluginConfig::new("/opt/plugins/audit"));
}

#[rstest]
#[case("json", LogFormat::Json)]
#[case("Compact", LogFormat::Compact)]
fn log_format_parses_case_insensitively(#[case] text: &str, #[case] expected: LogFormat) {
    assert_eq!(text.parse::<LogFormat>().expect("parse"), expected);
    assert_eq!(expected.to_string(), text.to_ascii_lowercase());
}
