//! Endpoints a plugin listens on and the host connects to.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::conduit::Conduit;

#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Address announced in a handshake line.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum Endpoint {
    /// Unix domain socket endpoint.
    Unix {
        /// Socket path.
        path: Utf8PathBuf,
    },
    /// TCP socket endpoint.
    Tcp {
        /// Host name or address.
        host: String,
        /// Port number.
        port: u16,
    },
}

impl Endpoint {
    /// Builds a Unix domain socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Builds a TCP socket endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Returns the Unix socket path when the endpoint uses the Unix transport.
    #[must_use]
    pub fn unix_path(&self) -> Option<&Utf8Path> {
        match self {
            Self::Unix { path } => Some(path.as_ref()),
            Self::Tcp { .. } => None,
        }
    }

    /// Connects to the endpoint.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised while resolving or connecting.
    pub fn connect(&self, timeout: Duration) -> io::Result<Box<dyn Conduit>> {
        match self {
            Self::Tcp { host, port } => {
                let addr = resolve(host, *port)?;
                let stream = TcpStream::connect_timeout(&addr, timeout)?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Self::Unix { path } => connect_unix(path),
        }
    }
}

#[cfg(unix)]
fn connect_unix(path: &Utf8Path) -> io::Result<Box<dyn Conduit>> {
    let stream = UnixStream::connect(path.as_std_path())?;
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
fn connect_unix(path: &Utf8Path) -> io::Result<Box<dyn Conduit>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("unix sockets are unsupported for endpoint unix://{path}"),
    ))
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no addresses resolved for {host}:{port}"),
        )
    })
}

impl fmt::Display for Endpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(formatter, "unix://{path}"),
            Self::Tcp { host, port } => write!(formatter, "tcp://{host}:{port}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(input)?;
        match url.scheme() {
            "unix" => {
                let path = url.path();
                if path.is_empty() {
                    return Err(EndpointParseError::MissingUnixPath(input.to_owned()));
                }
                Ok(Self::unix(path))
            }
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| EndpointParseError::MissingHost(input.to_owned()))?;
                let port = url
                    .port()
                    .ok_or_else(|| EndpointParseError::MissingPort(input.to_owned()))?;
                Ok(Self::tcp(host, port))
            }
            other => Err(EndpointParseError::UnsupportedScheme(other.to_owned())),
        }
    }
}

/// Errors encountered while parsing an [`Endpoint`] from text.
#[derive(Debug, Error)]
pub enum EndpointParseError {
    /// Scheme was not recognised.
    #[error("unsupported endpoint scheme '{0}'")]
    UnsupportedScheme(String),
    /// TCP host name was missing.
    #[error("missing TCP host in '{0}'")]
    MissingHost(String),
    /// TCP port was missing from the address.
    #[error("missing TCP port in '{0}'")]
    MissingPort(String),
    /// Unix socket path was absent.
    #[error("missing Unix socket path in '{0}'")]
    MissingUnixPath(String),
    /// URL failed to parse.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

/// A bound listener waiting for the host's single connection.
#[derive(Debug)]
pub struct EndpointListener {
    endpoint: Endpoint,
    kind: ListenerKind,
}

#[derive(Debug)]
enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl EndpointListener {
    /// Binds the endpoint.
    ///
    /// Binding TCP port 0 picks a free port; [`Self::endpoint`] reports it.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised while binding.
    pub fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind(resolve(host, *port)?)?;
                let local = listener.local_addr()?;
                Ok(Self {
                    endpoint: Endpoint::tcp(host.clone(), local.port()),
                    kind: ListenerKind::Tcp(listener),
                })
            }
            Endpoint::Unix { path } => bind_unix(endpoint, path),
        }
    }

    /// Returns the endpoint peers should connect to.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Accepts one connection, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `TimedOut` when nobody connects in time, or the accept error.
    pub fn accept(&self, timeout: Duration) -> io::Result<Box<dyn Conduit>> {
        self.set_nonblocking(true)?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(conduit) = self.try_accept()? {
                return Ok(conduit);
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no connection on {} within {}ms", self.endpoint, timeout.as_millis()),
                ));
            }
            thread::sleep(ACCEPT_BACKOFF);
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match &self.kind {
            ListenerKind::Tcp(listener) => listener.set_nonblocking(nonblocking),
            #[cfg(unix)]
            ListenerKind::Unix(listener) => listener.set_nonblocking(nonblocking),
        }
    }

    fn try_accept(&self) -> io::Result<Option<Box<dyn Conduit>>> {
        let accepted: io::Result<Box<dyn Conduit>> = match &self.kind {
            ListenerKind::Tcp(listener) => listener.accept().and_then(|(stream, _)| {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream) as Box<dyn Conduit>)
            }),
            #[cfg(unix)]
            ListenerKind::Unix(listener) => listener.accept().and_then(|(stream, _)| {
                stream.set_nonblocking(false)?;
                Ok(Box::new(stream) as Box<dyn Conduit>)
            }),
        };
        match accepted {
            Ok(conduit) => Ok(Some(conduit)),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(error),
        }
    }
}

#[cfg(unix)]
fn bind_unix(endpoint: &Endpoint, path: &Utf8Path) -> io::Result<EndpointListener> {
    let listener = UnixListener::bind(path.as_std_path())?;
    Ok(EndpointListener {
        endpoint: endpoint.clone(),
        kind: ListenerKind::Unix(listener),
    })
}

#[cfg(not(unix))]
fn bind_unix(endpoint: &Endpoint, _path: &Utf8Path) -> io::Result<EndpointListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("unix sockets are unsupported for endpoint {endpoint}"),
    ))
}
