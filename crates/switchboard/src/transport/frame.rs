//! `Content-Length` framing.
//!
//! Every message on a channel is framed the same way:
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <payload>
//! ```
//!
//! Reads on a channel are bounded by a poll interval, so a frame may arrive
//! in several pieces. [`FrameDecoder`] buffers the bytes it is given and
//! yields a frame only once it is complete.

use super::error::TransportError;

/// Largest payload a channel accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const MAX_HEADER_LEN: usize = 8 * 1024;

/// Wraps a payload in a `Content-Length` header.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    let mut frame = Vec::with_capacity(header.len() + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Appends bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as frames.
    #[must_use]
    pub const fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Removes and returns the next complete frame, if any.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::MissingContentLength` when a header block has
    /// no length, `TransportError::InvalidHeader` when a header is malformed
    /// or the header block grows without bound, and
    /// `TransportError::FrameTooLarge` when the payload exceeds
    /// [`MAX_FRAME_LEN`].
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let Some(header_end) = find_terminator(&self.buffer) else {
            if self.buffer.len() > MAX_HEADER_LEN {
                return Err(TransportError::InvalidHeader);
            }
            return Ok(None);
        };

        let header_bytes = self
            .buffer
            .get(..header_end)
            .ok_or(TransportError::InvalidHeader)?;
        let length = parse_content_length(header_bytes)?;
        if length > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                length,
                limit: MAX_FRAME_LEN,
            });
        }

        let body_start = header_end + HEADER_TERMINATOR.len();
        let body_end = body_start + length;
        if self.buffer.len() < body_end {
            return Ok(None);
        }

        let mut rest = self.buffer.split_off(body_end);
        std::mem::swap(&mut self.buffer, &mut rest);
        let payload = rest.split_off(body_start);
        Ok(Some(payload))
    }
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

fn parse_content_length(header_bytes: &[u8]) -> Result<usize, TransportError> {
    let headers = std::str::from_utf8(header_bytes).map_err(|_| TransportError::InvalidHeader)?;
    let mut content_length = None;
    for line in headers.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            return Err(TransportError::InvalidHeader);
        };
        // Other headers (e.g. Content-Type) are ignored.
        if name.trim().eq_ignore_ascii_case("content-length") {
            let parsed = value
                .trim()
                .parse::<usize>()
                .map_err(|_| TransportError::InvalidHeader)?;
            content_length = Some(parsed);
        }
    }
    content_length.ok_or(TransportError::MissingContentLength)
}
