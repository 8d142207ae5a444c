//! Translates configuration into core plugin host types.

use switchboard::events::TriggerPolicy;
use switchboard::handshake::HandshakeConfig;
use switchboard::process::{LaunchOptions, PluginSpec};
use switchboard::PluginHost;
use switchboard_config::{Config, PluginConfig};

/// Handshake every plugin must complete.
pub(crate) fn handshake(config: &Config) -> HandshakeConfig {
    HandshakeConfig::new(
        config.protocol_version,
        config.cookie_key.clone(),
        config.cookie_value.clone(),
    )
}

pub(crate) fn launch_options(config: &Config) -> LaunchOptions {
    LaunchOptions::default()
        .with_startup_timeout(config.startup_timeout())
        .with_call_timeout(config.call_timeout())
}

pub(crate) fn trigger_policy(config: &Config) -> TriggerPolicy {
    TriggerPolicy::default()
        .with_call_timeout(config.call_timeout())
        .with_max_concurrency(config.max_concurrency)
        .with_filter_by_registration(config.filter_by_registration)
}

pub(crate) fn plugin_spec(plugin: &PluginConfig) -> PluginSpec {
    PluginSpec::new(plugin.path.as_std_path())
        .with_name(plugin.display_name())
        .with_args(plugin.args.iter().map(String::as_str))
        .with_triggers(plugin.events.iter().map(String::as_str))
        .with_auto_encrypt(plugin.auto_encrypt)
}

/// Builds a host with no plugins started yet.
pub(crate) fn host(config: &Config) -> PluginHost {
    PluginHost::new(
        handshake(config),
        launch_options(config),
        trigger_policy(config),
    )
}

/// Specs for every configured plugin, in order.
pub(crate) fn plugin_specs(config: &Config) -> Vec<PluginSpec> {
    config.plugins.iter().map(plugin_spec).collect()
}
