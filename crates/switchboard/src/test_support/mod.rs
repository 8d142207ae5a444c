//! Helpers for exercising channels without spawning plugin processes.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use crate::capability::CapabilitySet;
use crate::transport::{Channel, ChannelOptions, Conduit, TransportError};

/// Returns two connected loopback streams.
///
/// # Errors
///
/// Returns the I/O error raised while binding or connecting.
pub fn socket_pair() -> io::Result<(Box<dyn Conduit>, Box<dyn Conduit>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let client = TcpStream::connect(listener.local_addr()?)?;
    let (server, _) = listener.accept()?;
    client.set_nodelay(true)?;
    server.set_nodelay(true)?;
    Ok((Box::new(client), Box::new(server)))
}

/// Two ends of one connection, labelled like a host and a plugin.
///
/// Dropping the pair closes both channels.
#[derive(Debug)]
pub struct ChannelPair {
    /// Host end; its label is the plugin name.
    pub host: Channel,
    /// Plugin end.
    pub plugin: Channel,
}

impl Drop for ChannelPair {
    fn drop(&mut self) {
        self.host.close();
        self.plugin.close();
    }
}

/// Connects a host exporting `host_caps` to a plugin named `plugin_name`
/// exporting `plugin_caps`.
///
/// # Errors
///
/// Returns the transport error raised while connecting or opening.
pub fn channel_pair(
    plugin_name: &str,
    host_caps: CapabilitySet,
    plugin_caps: CapabilitySet,
) -> Result<ChannelPair, TransportError> {
    let (host_end, plugin_end) = socket_pair()?;
    let options = ChannelOptions::default();
    let host = Channel::open(plugin_name, host_end, Arc::new(host_caps), options)?;
    let plugin = Channel::open("host", plugin_end, Arc::new(plugin_caps), options)?;
    Ok(ChannelPair { host, plugin })
}
