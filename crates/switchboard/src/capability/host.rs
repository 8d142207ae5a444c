//! The `host` capability the host exports back to its plugins.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::Level;

use super::{CallContext, CapabilityServer, Stub};
use crate::logger;
use crate::transport::CallError;
use crate::transport::jsonrpc::RpcError;

/// Capability name of the host's reverse-direction services.
pub const HOST_CAPABILITY: &str = "host";

/// A log record a plugin forwards to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Level name (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
    /// Log message.
    pub message: String,
    /// Call the record belongs to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<String>,
    /// Extra structured fields.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub fields: Value,
}

/// Serves `host.log` and `host.ping`.
///
/// Log records land on the plugin log target tagged with the channel's
/// peer name.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCapability;

impl CapabilityServer for HostCapability {
    fn name(&self) -> &str {
        HOST_CAPABILITY
    }

    fn call(&self, method: &str, params: Value, context: &CallContext<'_>) -> Result<Value, RpcError> {
        match method {
            "log" => {
                let record: LogRecord = serde_json::from_value(params)
                    .map_err(|err| RpcError::invalid_params(err.to_string()))?;
                let level = record.level.parse::<Level>().unwrap_or(Level::INFO);
                let fields = (!record.fields.is_null()).then_some(&record.fields);
                logger::emit_record(
                    context.peer(),
                    level,
                    &record.message,
                    record.call.as_deref(),
                    fields,
                );
                Ok(Value::Null)
            }
            "ping" => Ok(json!("pong")),
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

/// Plugin-side wrapper around a dispensed `host` stub.
#[derive(Debug, Clone)]
pub struct HostClient {
    stub: Stub,
    timeout: Duration,
}

impl HostClient {
    /// Wraps a stub dispensed for [`HOST_CAPABILITY`].
    #[must_use]
    pub const fn new(stub: Stub, timeout: Duration) -> Self {
        Self { stub, timeout }
    }

    /// Forwards a log record to the host without waiting for delivery.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Closed` when the channel is closed.
    pub fn log(&self, record: &LogRecord) -> Result<(), CallError> {
        let params = serde_json::to_value(record).map_err(|err| CallError::codec(&err))?;
        self.stub.notify("log", params)
    }

    /// Round-trips a ping through the host capability.
    ///
    /// # Errors
    ///
    /// Propagates the call failure.
    pub fn ping(&self) -> Result<(), CallError> {
        self.stub.call("ping", Value::Null, self.timeout).map(|_| ())
    }
}
