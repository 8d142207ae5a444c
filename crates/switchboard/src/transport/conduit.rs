//! Byte streams a channel can run over.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

/// A connected duplex stream owned by a channel's I/O thread.
///
/// Reads must return once the poll interval elapses so the I/O thread can
/// interleave writes and notice a local close. A poll timeout surfaces as
/// `WouldBlock` or `TimedOut`, depending on the platform.
pub trait Conduit: Read + Write + Send {
    /// Bounds how long a read may block.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    fn set_poll_interval(&mut self, interval: Option<Duration>) -> io::Result<()>;

    /// Shuts both directions of the stream down.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    fn shutdown(&mut self) -> io::Result<()>;
}

impl Conduit for TcpStream {
    fn set_poll_interval(&mut self, interval: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(interval)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

#[cfg(unix)]
impl Conduit for UnixStream {
    fn set_poll_interval(&mut self, interval: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(interval)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)
    }
}

/// Returns `true` when a read failed only because the poll interval elapsed.
pub(crate) fn is_poll_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
