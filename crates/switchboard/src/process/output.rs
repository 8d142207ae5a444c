//! Readers for a plugin's standard streams.
//!
//! The first stdout line is the handshake; everything after it, and all of
//! stderr, is forwarded to the plugin logger by background threads.

use std::io::{self, BufRead, BufReader, Read};
use std::sync::mpsc::{self, Receiver};
use std::thread;

use tracing::{debug, warn};

use super::PROCESS_TARGET;
use crate::logger::{LogStream, PluginLogSink};

/// First line of stdout, or `None` when the plugin closed stdout first.
pub(super) type HandshakeReceiver = Receiver<io::Result<Option<String>>>;

/// Longest handshake line accepted, newline included. Matches the frame
/// header bound.
pub(super) const MAX_HANDSHAKE_LINE: u64 = 8 * 1024;

/// Reads the handshake line, failing with `InvalidData` once
/// [`MAX_HANDSHAKE_LINE`] bytes pass without a newline.
fn read_handshake_line(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    let mut limited = reader.take(MAX_HANDSHAKE_LINE);
    if limited.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    if limited.limit() == 0 && !line.ends_with('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("handshake line exceeds {MAX_HANDSHAKE_LINE} bytes"),
        ));
    }
    Ok(Some(line))
}

/// Starts the stdout reader.
///
/// The returned receiver yields the handshake line once; the thread then
/// pumps the remaining output into the plugin logger until EOF.
pub(super) fn spawn_stdout_reader(
    plugin: &str,
    stdout: impl Read + Send + 'static,
) -> io::Result<HandshakeReceiver> {
    let (sender, receiver) = mpsc::channel();
    let name = plugin.to_owned();
    thread::Builder::new()
        .name(format!("switchboard-stdout-{plugin}"))
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            let first = read_handshake_line(&mut reader);
            let reached_handshake = matches!(first, Ok(Some(_)));
            if sender.send(first).is_err() {
                debug!(target: PROCESS_TARGET, plugin = %name, "handshake reader abandoned");
            }
            if reached_handshake {
                pump(&name, reader, LogStream::Stdout);
            }
        })?;
    Ok(receiver)
}

/// Forwards stderr into the plugin logger until EOF.
pub(super) fn spawn_stderr_pump(plugin: &str, stderr: impl Read + Send + 'static) -> io::Result<()> {
    let name = plugin.to_owned();
    thread::Builder::new()
        .name(format!("switchboard-stderr-{plugin}"))
        .spawn(move || pump(&name, stderr, LogStream::Stderr))?;
    Ok(())
}

fn pump(plugin: &str, mut source: impl Read, stream: LogStream) {
    let mut sink = PluginLogSink::for_stream(plugin, stream);
    if let Err(err) = io::copy(&mut source, &mut sink) {
        warn!(target: PROCESS_TARGET, plugin, error = %err, "plugin output stream failed");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    fn oversized() -> Vec<u8> {
        vec![b'x'; 10 * 1024]
    }

    #[rstest]
    #[case::line("{\"core_version\":1}\nlater output\n", Some("{\"core_version\":1}\n"))]
    #[case::unterminated("{}", Some("{}"))]
    #[case::closed("", None)]
    fn handshake_line_is_the_first_line(#[case] input: &str, #[case] expected: Option<&str>) {
        let mut reader = Cursor::new(input.as_bytes());
        let line = read_handshake_line(&mut reader).expect("read");
        assert_eq!(line.as_deref(), expected);
    }

    #[rstest]
    fn line_at_the_limit_is_accepted() {
        let mut input = vec![b'x'; 8 * 1024 - 1];
        input.push(b'\n');
        let line = read_handshake_line(&mut Cursor::new(input))
            .expect("read")
            .expect("line");
        assert_eq!(line.len(), 8 * 1024);
    }

    #[rstest]
    fn endless_line_is_rejected() {
        let err = read_handshake_line(&mut Cursor::new(oversized())).expect_err("too long");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("8192"), "{err}");
    }

    #[rstest]
    fn reader_thread_reports_an_endless_line() {
        let receiver = spawn_stdout_reader("chatty", Cursor::new(oversized())).expect("spawn");
        let first = receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("reader answers");
        assert!(first.is_err());
    }
}
