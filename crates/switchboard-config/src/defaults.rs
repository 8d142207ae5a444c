use std::time::Duration;

/// Default log filter expression used by the host.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Environment variable naming the cookie the host exports to plugins.
pub const DEFAULT_COOKIE_KEY: &str = "SWITCHBOARD_RPC_COOKIE";

/// Cookie value plugins built against the default handshake expect.
pub const DEFAULT_COOKIE_VALUE: &str = "switchboard-rpc";

/// Application protocol version spoken by default.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 1;

/// Budget for a plugin to print its handshake line.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for each remote call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on concurrent trigger calls.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Default log filter expression used by the host.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the host.
#[must_use]
pub const fn default_log_format() -> crate::logging::LogFormat {
    crate::logging::LogFormat::Json
}
