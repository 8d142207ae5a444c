//! Named capabilities a peer exports and the stubs that call them.
//!
//! A capability is a named set of remote methods. On the serving side each
//! capability is a [`CapabilityServer`]; a [`CapabilitySet`] routes incoming
//! calls named `<capability>.<method>` to the right server and answers the
//! built-in `$/dispense` request. On the calling side a [`Dispenser`] turns a
//! capability name into a [`Stub`] bound to the channel.
//!
//! # Example
//!
//! ```
//! use serde_json::{Value, json};
//! use switchboard::capability::{CallContext, CapabilityServer, CapabilitySet};
//! use switchboard::transport::jsonrpc::RpcError;
//!
//! struct Clock;
//!
//! impl CapabilityServer for Clock {
//!     fn name(&self) -> &str {
//!         "clock"
//!     }
//!
//!     fn call(&self, method: &str, _params: Value, _ctx: &CallContext<'_>) -> Result<Value, RpcError> {
//!         match method {
//!             "now" => Ok(json!(0)),
//!             other => Err(RpcError::method_not_found(other)),
//!         }
//!     }
//! }
//!
//! let set = CapabilitySet::new().with(Clock);
//! assert_eq!(set.names(), vec!["clock".to_owned()]);
//! ```

mod host;


use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::PluginError;
use crate::transport::jsonrpc::{CAPABILITY_NOT_EXPORTED, DISPENSE_METHOD, RpcError};
use crate::transport::{CallError, Channel, RequestHandler};

pub use self::host::{HOST_CAPABILITY, HostCapability, HostClient, LogRecord};

/// Context handed to a capability server for one call.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    channel: &'a Channel,
    capability: &'a str,
}

impl<'a> CallContext<'a> {
    /// Returns the channel the call arrived on.
    #[must_use]
    pub const fn channel(&self) -> &'a Channel {
        self.channel
    }

    /// Returns the peer label of the channel, the plugin name on the host.
    #[must_use]
    pub fn peer(&self) -> &'a str {
        self.channel.label()
    }

    /// Returns the capability being called.
    #[must_use]
    pub const fn capability(&self) -> &'a str {
        self.capability
    }
}

/// Serves the methods of one named capability.
pub trait CapabilityServer: Send + Sync {
    /// Capability name, e.g. `eventplugin`.
    fn name(&self) -> &str;

    /// Handles `method` (without the capability prefix).
    ///
    /// # Errors
    ///
    /// Returns the JSON-RPC error object sent back to the caller.
    fn call(&self, method: &str, params: Value, context: &CallContext<'_>)
    -> Result<Value, RpcError>;
}

/// Capabilities exported on one side of a channel.
#[derive(Clone, Default)]
pub struct CapabilitySet {
    servers: BTreeMap<String, Arc<dyn CapabilityServer>>,
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CapabilitySet")
            .field("capabilities", &self.names())
            .finish()
    }
}

impl CapabilitySet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a server and returns the set.
    #[must_use]
    pub fn with(mut self, server: impl CapabilityServer + 'static) -> Self {
        self.insert(Arc::new(server));
        self
    }

    /// Adds a shared server, replacing any server with the same name.
    pub fn insert(&mut self, server: Arc<dyn CapabilityServer>) {
        self.servers.insert(server.name().to_owned(), server);
    }

    /// Returns `true` when `name` is exported.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    /// Exported capability names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    fn dispense(&self, params: &Value) -> Result<Value, RpcError> {
        let capability = params
            .get("capability")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("missing 'capability'"))?;
        if self.contains(capability) {
            Ok(json!({ "capability": capability }))
        } else {
            Err(RpcError::new(
                CAPABILITY_NOT_EXPORTED,
                format!("capability '{capability}' is not exported"),
            ))
        }
    }
}

impl RequestHandler for CapabilitySet {
    fn handle(&self, method: &str, params: Value, channel: &Channel) -> Result<Value, RpcError> {
        if method == DISPENSE_METHOD {
            return self.dispense(&params);
        }
        let Some((capability, operation)) = method.split_once('.') else {
            return Err(RpcError::method_not_found(method));
        };
        let Some(server) = self.servers.get(capability) else {
            return Err(RpcError::method_not_found(method));
        };
        let context = CallContext {
            channel,
            capability,
        };
        server.call(operation, params, &context)
    }
}

/// Requests capability stubs from the peer of a channel.
#[derive(Debug, Clone)]
pub struct Dispenser {
    plugin: String,
    channel: Channel,
    timeout: Duration,
}

impl Dispenser {
    /// Creates a dispenser for the peer named `plugin`.
    #[must_use]
    pub fn new(plugin: impl Into<String>, channel: Channel, timeout: Duration) -> Self {
        Self {
            plugin: plugin.into(),
            channel,
            timeout,
        }
    }

    /// Returns a stub for `capability`.
    ///
    /// Every call yields a fresh stub; stubs share the underlying channel.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::CapabilityNotExported`] when the peer does not
    /// serve the capability and [`PluginError::Call`] for transport failures.
    pub fn dispense(&self, capability: &str) -> Result<Stub, PluginError> {
        let params = json!({ "capability": capability });
        match self.channel.call(DISPENSE_METHOD, params, self.timeout) {
            Ok(_) => Ok(Stub {
                plugin: self.plugin.clone(),
                capability: capability.to_owned(),
                channel: self.channel.clone(),
            }),
            Err(CallError::Remote { code, .. }) if code == CAPABILITY_NOT_EXPORTED => {
                Err(PluginError::CapabilityNotExported {
                    name: self.plugin.clone(),
                    capability: capability.to_owned(),
                })
            }
            Err(source) => Err(PluginError::Call {
                name: self.plugin.clone(),
                source,
            }),
        }
    }
}

/// Local proxy for a capability served by the peer.
#[derive(Debug, Clone)]
pub struct Stub {
    plugin: String,
    capability: String,
    channel: Channel,
}

impl Stub {
    /// Returns the peer name.
    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Returns the capability name.
    #[must_use]
    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Returns the channel the stub forwards to.
    #[must_use]
    pub const fn channel(&self) -> &Channel {
        &self.channel
    }

    fn method_name(&self, method: &str) -> String {
        format!("{}.{method}", self.capability)
    }

    /// Calls `method` on the remote capability.
    ///
    /// # Errors
    ///
    /// Propagates the channel's [`CallError`].
    pub fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, CallError> {
        self.channel.call(&self.method_name(method), params, timeout)
    }

    /// Calls `method` with typed parameters and decodes the result.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Codec` when encoding or decoding fails, otherwise
    /// propagates the channel's [`CallError`].
    pub fn call_typed<P, R>(&self, method: &str, params: &P, timeout: Duration) -> Result<R, CallError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let encoded = serde_json::to_value(params).map_err(|err| CallError::codec(&err))?;
        let result = self.call(method, encoded, timeout)?;
        serde_json::from_value(result).map_err(|err| CallError::codec(&err))
    }

    /// Sends a notification to `method` on the remote capability.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Closed` when the channel is closed.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), CallError> {
        self.channel.notify(&self.method_name(method), params)
    }
}
