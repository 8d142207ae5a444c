//! Routes plugin diagnostics into the host's `tracing` pipeline.
//!
//! Every record lands on [`PLUGIN_LOG_TARGET`] with a `plugin` field, so the
//! host's subscriber can send plugin output to a destination of its own.
//! [`PluginLogSink`] accepts the raw byte stream of a plugin's stdout or
//! stderr; lines that are JSON records written by a `tracing-subscriber`
//! JSON formatter keep their original level, message, and `call` field.

use std::io::{self, Write};
use std::mem;

use serde_json::Value;
use tracing::{Level, debug, error, info, trace, warn};

/// Target carried by every plugin log record.
pub const PLUGIN_LOG_TARGET: &str = "switchboard::plugin_log";

const MAX_LINE_LEN: usize = 64 * 1024;

/// Stream a sink is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    /// Plugin standard output after the handshake line.
    Stdout,
    /// Plugin standard error.
    Stderr,
    /// Records written directly by host-side code.
    Direct,
}

impl LogStream {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Direct => "direct",
        }
    }
}

/// Writer that turns each line into a structured log record.
///
/// # Example
///
/// ```
/// use std::io::Write;
/// use switchboard::logger::PluginLogSink;
///
/// let mut sink = PluginLogSink::new("rpc-events");
/// writeln!(sink, "hello from the plugin").expect("write");
/// ```
#[derive(Debug)]
pub struct PluginLogSink {
    plugin: String,
    stream: LogStream,
    pending: Vec<u8>,
}

impl PluginLogSink {
    /// Creates a sink tagged with `plugin`.
    #[must_use]
    pub fn new(plugin: impl Into<String>) -> Self {
        Self::for_stream(plugin, LogStream::Direct)
    }

    /// Creates a sink for one of the plugin's standard streams.
    #[must_use]
    pub fn for_stream(plugin: impl Into<String>, stream: LogStream) -> Self {
        Self {
            plugin: plugin.into(),
            stream,
            pending: Vec::new(),
        }
    }

    /// Returns the plugin name records are tagged with.
    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    fn emit_complete_lines(&mut self) {
        while let Some(end) = self.pending.iter().position(|byte| *byte == b'\n') {
            let rest = self.pending.split_off(end + 1);
            let line = mem::replace(&mut self.pending, rest);
            self.emit_bytes(&line);
        }
        if self.pending.len() > MAX_LINE_LEN {
            let line = mem::take(&mut self.pending);
            self.emit_bytes(&line);
        }
    }

    fn emit_bytes(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let line = text.trim_end_matches(['\r', '\n']);
        if !line.trim().is_empty() {
            emit_line(&self.plugin, self.stream, line);
        }
    }
}

impl Write for PluginLogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        self.emit_complete_lines();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let line = mem::take(&mut self.pending);
        self.emit_bytes(&line);
        Ok(())
    }
}

impl Drop for PluginLogSink {
    fn drop(&mut self) {
        let line = mem::take(&mut self.pending);
        self.emit_bytes(&line);
    }
}

/// Creates the log sink for a plugin.
#[must_use]
pub fn new_plugin_logger(name: &str) -> PluginLogSink {
    PluginLogSink::new(name)
}

/// A JSON record recovered from a plugin log line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    /// Original level.
    pub level: Level,
    /// Record message.
    pub message: String,
    /// Call the record belongs to, when present.
    pub call: Option<String>,
    /// Remaining fields.
    pub fields: Option<Value>,
}

/// Parses a line written by a `tracing-subscriber` JSON formatter.
///
/// Returns `None` for lines that are not JSON objects with a level.
#[must_use]
pub fn parse_json_record(line: &str) -> Option<ParsedRecord> {
    let record: Value = serde_json::from_str(line.trim()).ok()?;
    let level = record.get("level")?.as_str()?.parse::<Level>().ok()?;
    let mut fields = record.get("fields").cloned().unwrap_or(Value::Null);
    let message = fields
        .as_object_mut()
        .and_then(|map| map.remove("message"))
        .and_then(|value| value.as_str().map(str::to_owned))
        .unwrap_or_default();
    let call = fields
        .as_object_mut()
        .and_then(|map| map.remove("call"))
        .map(|value| match value {
            Value::String(text) => text,
            other => other.to_string(),
        });
    let remaining = fields
        .as_object()
        .filter(|map| !map.is_empty())
        .map(|_| fields.clone());
    Some(ParsedRecord {
        level,
        message,
        call,
        fields: remaining,
    })
}

fn emit_line(plugin: &str, stream: LogStream, line: &str) {
    parse_json_record(line).map_or_else(
        || emit_at(plugin, stream, Level::INFO, line, None, None),
        |record| {
            emit_at(
                plugin,
                stream,
                record.level,
                &record.message,
                record.call.as_deref(),
                record.fields.as_ref(),
            );
        },
    );
}

/// Emits one record on the plugin log target.
pub fn emit_record(
    plugin: &str,
    level: Level,
    message: &str,
    call: Option<&str>,
    fields: Option<&Value>,
) {
    emit_at(plugin, LogStream::Direct, level, message, call, fields);
}

fn emit_at(
    plugin: &str,
    stream: LogStream,
    level: Level,
    message: &str,
    call: Option<&str>,
    fields: Option<&Value>,
) {
    let stream_name = stream.as_str();
    let extra = fields.map(Value::to_string);
    // `tracing` needs the level at compile time.
    match level {
        Level::ERROR => {
            error!(target: PLUGIN_LOG_TARGET, plugin, stream = stream_name, call, fields = extra, "{message}");
        }
        Level::WARN => {
            warn!(target: PLUGIN_LOG_TARGET, plugin, stream = stream_name, call, fields = extra, "{message}");
        }
        Level::INFO => {
            info!(target: PLUGIN_LOG_TARGET, plugin, stream = stream_name, call, fields = extra, "{message}");
        }
        Level::DEBUG => {
            debug!(target: PLUGIN_LOG_TARGET, plugin, stream = stream_name, call, fields = extra, "{message}");
        }
        _ => {
            trace!(target: PLUGIN_LOG_TARGET, plugin, stream = stream_name, call, fields = extra, "{message}");
        }
    }
}
