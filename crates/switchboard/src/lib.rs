//! Out-of-process plugins and event dispatch for Switchboard.
//!
//! Plugins are separate executables. The host spawns each one, checks the
//! handshake line it prints, connects to the endpoint it announces and talks
//! to it over a duplex JSON-RPC [`transport::Channel`]. Every plugin serves
//! the `eventplugin` capability; the host fans named event triggers out to
//! all live plugins and folds their replies into one
//! [`events::AggregatedResult`]. A plugin that crashes, hangs or panics is
//! contained: the host records the failure and carries on.
//!
//! # Architecture
//!
//! - [`handshake`]: cookie and version contract checked before any call.
//! - [`transport`]: framing, JSON-RPC, endpoints, mutual TLS and channels.
//! - [`process`]: spawning, supervising and killing plugin processes.
//! - [`capability`]: named capabilities, `$/dispense` and stubs.
//! - [`events`]: the `eventplugin` capability and trigger fan-out.
//! - [`registry`]: live plugin handles shared with the dispatcher.
//! - [`host`]: bootstrap that starts configured plugins.
//! - [`serve`]: the plugin-side entry point.
//! - [`logger`]: plugin output routed into `tracing`.
//!
//! # Example
//!
//! ```rust,no_run
//! use switchboard::events::{EventData, TriggerPolicy};
//! use switchboard::handshake::HandshakeConfig;
//! use switchboard::host::PluginHost;
//! use switchboard::process::{LaunchOptions, PluginSpec};
//!
//! let host = PluginHost::new(
//!     HandshakeConfig::default(),
//!     LaunchOptions::default(),
//!     TriggerPolicy::default(),
//! );
//! let report = host.start_all(&[PluginSpec::new("/usr/libexec/audit-plugin")]);
//! println!("{} plugin(s) started", report.started.len());
//!
//! let result = host.trigger("post-created", &EventData::new().with(42_i64));
//! if let Some(error) = result.first_error() {
//!     eprintln!("a plugin failed: {error}");
//! }
//! host.shutdown();
//! ```

pub mod capability;
pub mod error;
pub mod events;
pub mod handshake;
pub mod host;
pub mod logger;
pub mod process;
pub mod registry;
pub mod serve;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

#[cfg(test)]
mod tests;

pub use self::error::PluginError;
pub use self::events::{AggregatedResult, EventData, EventValue, TriggerPolicy};
pub use self::handshake::HandshakeConfig;
pub use self::host::PluginHost;
pub use self::process::{LaunchOptions, PluginSpec};
