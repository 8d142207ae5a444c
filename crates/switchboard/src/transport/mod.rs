//! Duplex call channel between the host and one plugin.
//!
//! Frames use `Content-Length` headers and carry JSON-RPC 2.0 messages. Both
//! ends may issue and serve calls at the same time; the request id tags each
//! call so concurrent call pairs never interleave. A channel optionally runs
//! over a mutually authenticated TLS session.

mod channel;
mod conduit;
mod endpoint;
mod error;
mod frame;
pub mod jsonrpc;
pub mod tls;

pub use self::channel::{Channel, ChannelOptions, DEFAULT_POLL_INTERVAL, RequestHandler};
pub(crate) use self::channel::panic_message;
pub use self::conduit::Conduit;
pub use self::endpoint::{Endpoint, EndpointListener, EndpointParseError};
pub use self::error::{CallError, TlsError, TransportError};
pub use self::frame::{FrameDecoder, MAX_FRAME_LEN, encode_frame};

pub(crate) const TRANSPORT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");
