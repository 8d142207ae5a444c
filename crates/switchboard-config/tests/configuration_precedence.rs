//! Behaviour tests for the order in which configuration layers apply.

use std::cell::RefCell;
use std::ffi::OsString;
use std::fs;
use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::Utf8PathBuf;
use once_cell::sync::Lazy;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tempfile::TempDir;

use switchboard_config::{CONFIG_PATH_ENV, Config, LOG_FILTER_ENV, PluginConfig};

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

struct Harness {
    temp_dir: TempDir,
    file: RefCell<Option<Utf8PathBuf>>,
    cli_args: RefCell<Vec<OsString>>,
    explicit: RefCell<bool>,
    env_overrides: RefCell<Vec<(String, Option<OsString>)>>,
    loaded: RefCell<Option<Config>>,
    _env_guard: MutexGuard<'static, ()>,
}

impl Harness {
    fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("create temp dir"),
            file: RefCell::new(None),
            cli_args: RefCell::new(Vec::new()),
            explicit: RefCell::new(true),
            env_overrides: RefCell::new(Vec::new()),
            loaded: RefCell::new(None),
            _env_guard: ENV_MUTEX.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn write_config(&self, toml: &str) {
        let path = Utf8PathBuf::from_path_buf(self.temp_dir.path().join("switchboard.toml"))
            .expect("utf-8 temp path");
        fs::write(&path, toml).expect("write configuration");
        *self.file.borrow_mut() = Some(path);
    }

    fn set_env(&self, key: &str, value: &str) {
        let previous = std::env::var_os(key);
        // Environment mutation is `unsafe` in edition 2024. Overrides are
        // restored in `Drop` while the mutex is still held.
        unsafe { std::env::set_var(key, value) };
        self.env_overrides
            .borrow_mut()
            .push((key.to_owned(), previous));
    }

    fn load(&self) -> Config {
        if let Some(config) = self.loaded.borrow().as_ref() {
            return config.clone();
        }
        let mut args = vec![OsString::from("switchboard")];
        if *self.explicit.borrow()
            && let Some(path) = self.file.borrow().as_ref()
        {
            args.push(OsString::from("--config-path"));
            args.push(OsString::from(path.as_str()));
        }
        args.extend(self.cli_args.borrow().iter().cloned());
        let config = Config::load_validated(args).expect("configuration loads");
        *self.loaded.borrow_mut() = Some(config.clone());
        config
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let mut overrides = self.env_overrides.borrow_mut();
        while let Some((key, value)) = overrides.pop() {
            if let Some(previous) = value {
                unsafe { std::env::set_var(&key, previous) };
            } else {
                unsafe { std::env::remove_var(&key) };
            }
        }
    }
}

#[fixture]
fn harness() -> Harness {
    Harness::new()
}

#[given("a configuration file setting the log filter to \"{filter}\"")]
fn given_file_filter(harness: &Harness, filter: String) {
    harness.write_config(&format!("log_filter = \"{filter}\"\n"));
}

#[given("a configuration file listing the plugin \"{path}\"")]
fn given_file_plugin(harness: &Harness, path: String) {
    harness.write_config(&format!("[[plugins]]\npath = \"{path}\"\n"));
}

#[given("the environment sets the log filter to \"{filter}\"")]
fn given_env_filter(harness: &Harness, filter: String) {
    harness.set_env(LOG_FILTER_ENV, &filter);
}

#[given("the environment points at that file")]
fn given_env_path(harness: &Harness) {
    let path = harness.file.borrow().clone().expect("file written");
    harness.set_env(CONFIG_PATH_ENV, path.as_str());
}

#[when("the command line sets the log filter to \"{filter}\"")]
fn when_cli_filter(harness: &Harness, filter: String) {
    let mut args = harness.cli_args.borrow_mut();
    args.push(OsString::from("--log-filter"));
    args.push(OsString::from(filter));
}

#[when("the configuration loads without overrides")]
fn when_load_defaults(harness: &Harness) {
    harness.load();
}

#[when("the configuration loads without an explicit path")]
fn when_load_implicit(harness: &Harness) {
    *harness.explicit.borrow_mut() = false;
    harness.load();
}

#[then("the log filter is \"{filter}\"")]
fn then_filter(harness: &Harness, filter: String) {
    assert_eq!(harness.load().log_filter(), filter);
}

#[then("no plugins are configured")]
fn then_no_plugins(harness: &Harness) {
    assert!(harness.load().plugins.is_empty());
}

#[then("the plugin \"{name}\" is configured")]
fn then_plugin(harness: &Harness, name: String) {
    let config = harness.load();
    let names: Vec<&str> = config.plugins.iter().map(PluginConfig::display_name).collect();
    assert_eq!(names, [name.as_str()]);
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "Built-in defaults apply without a file"
)]
fn defaults_apply(#[from(harness)] harness: Harness) {
    drop(harness);
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "The file overrides the defaults"
)]
fn file_overrides_defaults(#[from(harness)] harness: Harness) {
    drop(harness);
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "The environment overrides the file"
)]
fn environment_overrides_file(#[from(harness)] harness: Harness) {
    drop(harness);
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "A flag overrides the environment"
)]
fn flag_overrides_environment(#[from(harness)] harness: Harness) {
    drop(harness);
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "The environment names the configuration file"
)]
fn environment_names_file(#[from(harness)] harness: Harness) {
    drop(harness);
}
