//! Error types for the framed call channel.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use super::jsonrpc::RpcError;

/// Errors raised while reading or writing frames.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error during read or write.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame header block carried no `Content-Length`.
    #[error("missing Content-Length header")]
    MissingContentLength,

    /// A frame header could not be parsed.
    #[error("invalid header format")]
    InvalidHeader,

    /// A frame announced a payload larger than the channel accepts.
    #[error("frame of {length} bytes exceeds the {limit} byte limit")]
    FrameTooLarge {
        /// Announced payload length.
        length: usize,
        /// Configured maximum payload length.
        limit: usize,
    },
}

/// Failures observed by a caller blocked in [`super::Channel::call`].
///
/// The type is `Clone` because a single channel closure must be reported to
/// every caller that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The channel closed before a response arrived.
    #[error("channel closed: {reason}")]
    Closed {
        /// Why the channel closed.
        reason: String,
    },

    /// No response arrived within the caller's budget.
    #[error("call '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Method that was invoked.
        method: String,
        /// Budget in milliseconds.
        timeout_ms: u64,
    },

    /// The peer answered with a JSON-RPC error object.
    #[error("remote error {code}: {message}")]
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// Error message supplied by the peer.
        message: String,
    },

    /// A message could not be encoded or a result could not be decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the encoding failure.
        message: String,
    },
}

impl CallError {
    /// Creates a remote error from a JSON-RPC error object.
    #[must_use]
    pub fn from_rpc(error: RpcError) -> Self {
        Self::Remote {
            code: error.code,
            message: error.message,
        }
    }

    /// Returns `true` when the failure means the channel itself is unusable.
    #[must_use]
    pub const fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// Returns the JSON-RPC code for remote errors.
    #[must_use]
    pub const fn remote_code(&self) -> Option<i64> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn codec(error: &serde_json::Error) -> Self {
        Self::Codec {
            message: error.to_string(),
        }
    }
}

/// Failures while establishing a mutually authenticated session.
#[derive(Debug, Clone, Error)]
pub enum TlsError {
    /// A per-session certificate could not be generated.
    #[error("failed to generate session certificate: {message}")]
    Certificate {
        /// Generator failure description.
        message: String,
    },

    /// A peer certificate could not be decoded.
    #[error("failed to decode peer certificate: {message}")]
    Decode {
        /// Decoder failure description.
        message: String,
    },

    /// The TLS configuration was rejected.
    #[error("invalid TLS configuration: {message}")]
    Config {
        /// Configuration failure description.
        message: String,
    },

    /// The TLS handshake did not complete.
    #[error("TLS handshake failed: {source}")]
    Handshake {
        /// Underlying I/O or protocol failure.
        #[source]
        source: Arc<io::Error>,
    },
}
