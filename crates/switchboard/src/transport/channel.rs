//! Symmetric, multiplexed call channel.
//!
//! A [`Channel`] owns one connected [`Conduit`]. A dedicated I/O thread
//! writes queued frames and reads with a short poll interval. Responses are
//! routed to the waiting caller through a pending-call table keyed by request
//! id; incoming requests are served on their own threads so a slow handler
//! never blocks other calls on the same channel.

use std::any::Any;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::conduit::{Conduit, is_poll_timeout};
use super::error::{CallError, TransportError};
use super::frame::{FrameDecoder, encode_frame};
use super::jsonrpc::{
    Message, Notification, PARSE_ERROR, PING_METHOD, Request, Response, RpcError,
};
use super::TRANSPORT_TARGET;

const READ_CHUNK: usize = 16 * 1024;

/// Default bound on a single blocking read.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Serves calls arriving from the peer.
pub trait RequestHandler: Send + Sync {
    /// Handles one request or notification.
    ///
    /// `channel` is the channel the call arrived on, so handlers can call
    /// back into the peer.
    ///
    /// # Errors
    ///
    /// Returns the JSON-RPC error object sent back to the caller.
    fn handle(&self, method: &str, params: Value, channel: &Channel) -> Result<Value, RpcError>;
}

/// Tunables for a channel's I/O thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    poll_interval: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ChannelOptions {
    /// Sets the read poll interval. Zero is replaced by the default.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = if poll_interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            poll_interval
        };
        self
    }

    /// Returns the read poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

type Waiter = Sender<Result<Value, CallError>>;

struct Shared {
    label: String,
    next_id: AtomicU64,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    outgoing: Mutex<Option<Sender<Vec<u8>>>>,
    pending: Mutex<HashMap<u64, Waiter>>,
}

/// Handle to a duplex call channel. Clones share the same connection.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Channel")
            .field("label", &self.shared.label)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Channel {
    /// Starts the I/O thread for `conduit` and returns the channel handle.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` when the poll interval cannot be applied
    /// or the I/O thread cannot be spawned.
    pub fn open(
        label: impl Into<String>,
        mut conduit: Box<dyn Conduit>,
        handler: Arc<dyn RequestHandler>,
        options: ChannelOptions,
    ) -> Result<Self, TransportError> {
        conduit.set_poll_interval(Some(options.poll_interval()))?;
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(Shared {
            label: label.into(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            outgoing: Mutex::new(Some(sender)),
            pending: Mutex::new(HashMap::new()),
        });
        let worker = IoWorker {
            shared: Arc::clone(&shared),
            conduit,
            outgoing: receiver,
            handler,
        };
        thread::Builder::new()
            .name(format!("switchboard-io-{}", shared.label))
            .spawn(move || worker.run())?;
        debug!(target: TRANSPORT_TARGET, channel = %shared.label, "channel opened");
        Ok(Self { shared })
    }

    /// Returns the label used in logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Returns `true` once the channel can no longer carry calls.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Returns why the channel closed, if it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<String> {
        lock(&self.shared.close_reason).clone()
    }

    /// Issues a call and blocks until the response, `timeout`, or closure.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Closed` when the channel is or becomes closed,
    /// `CallError::Timeout` when no response arrives in time, and
    /// `CallError::Remote` when the peer answers with an error object.
    pub fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, CallError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (waiter, response) = mpsc::channel();
        {
            let mut pending = lock(&self.shared.pending);
            if self.is_closed() {
                return Err(self.closed_error());
            }
            pending.insert(id, waiter);
        }

        let request = Request::new(id, method, Some(params));
        if let Err(error) = self.send(&request) {
            lock(&self.shared.pending).remove(&id);
            return Err(error);
        }
        trace!(target: TRANSPORT_TARGET, channel = %self.shared.label, id, method, "call sent");

        match response.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                let still_pending = lock(&self.shared.pending).remove(&id).is_some();
                // The response may have been routed just after the deadline.
                if !still_pending && let Ok(result) = response.try_recv() {
                    return result;
                }
                Err(CallError::Timeout {
                    method: method.to_owned(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.closed_error()),
        }
    }

    /// Sends a notification; no response is expected.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Closed` when the channel is closed.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), CallError> {
        self.send(&Notification::new(method, Some(params)))
    }

    /// Probes the peer with the built-in ping method.
    ///
    /// # Errors
    ///
    /// Propagates the call failure.
    pub fn ping(&self, timeout: Duration) -> Result<(), CallError> {
        self.call(PING_METHOD, Value::Null, timeout).map(|_| ())
    }

    /// Closes the channel and fails every pending call.
    ///
    /// Calling `close` more than once is a no-op.
    pub fn close(&self) {
        if self.shared.finish("closed locally") {
            debug!(target: TRANSPORT_TARGET, channel = %self.shared.label, "channel closed locally");
        }
    }

    fn closed_error(&self) -> CallError {
        CallError::Closed {
            reason: self
                .close_reason()
                .unwrap_or_else(|| "channel closed".to_owned()),
        }
    }

    fn send(&self, message: &impl Serialize) -> Result<(), CallError> {
        let payload = serde_json::to_vec(message).map_err(|err| CallError::codec(&err))?;
        let frame = encode_frame(&payload);
        let outgoing = lock(&self.shared.outgoing);
        match outgoing.as_ref().map(|sender| sender.send(frame)) {
            Some(Ok(())) => Ok(()),
            _ => Err(self.closed_error()),
        }
    }
}

impl Shared {
    /// Marks the channel closed and resolves pending calls.
    ///
    /// Returns `false` when the channel was already closed.
    fn finish(&self, reason: &str) -> bool {
        let mut pending = lock(&self.pending);
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        *lock(&self.close_reason) = Some(reason.to_owned());
        lock(&self.outgoing).take();
        for (id, waiter) in pending.drain() {
            if waiter
                .send(Err(CallError::Closed {
                    reason: reason.to_owned(),
                }))
                .is_err()
            {
                trace!(target: TRANSPORT_TARGET, channel = %self.label, id, "caller already gone");
            }
        }
        true
    }

    fn complete(&self, response: Response) {
        let Some(id) = response.id else {
            warn!(
                target: TRANSPORT_TARGET,
                channel = %self.label,
                error = ?response.error,
                "peer sent a response without an id"
            );
            return;
        };
        let Some(waiter) = lock(&self.pending).remove(&id) else {
            debug!(target: TRANSPORT_TARGET, channel = %self.label, id, "dropping late response");
            return;
        };
        let result = response.into_result().map_err(CallError::from_rpc);
        if waiter.send(result).is_err() {
            trace!(target: TRANSPORT_TARGET, channel = %self.label, id, "caller already gone");
        }
    }
}

struct IoWorker {
    shared: Arc<Shared>,
    conduit: Box<dyn Conduit>,
    outgoing: Receiver<Vec<u8>>,
    handler: Arc<dyn RequestHandler>,
}

enum Step {
    Continue,
    Stop(String),
}

impl IoWorker {
    fn run(mut self) {
        let mut decoder = FrameDecoder::new();
        let mut buffer = vec![0_u8; READ_CHUNK];
        let reason = loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                break None;
            }
            // Only this worker holds a reference: every handle was dropped.
            if Arc::strong_count(&self.shared) == 1 {
                break Some("all channel handles dropped".to_owned());
            }
            if let Step::Stop(reason) = self.flush_outgoing() {
                break Some(reason);
            }
            if let Step::Stop(reason) = self.read_once(&mut decoder, &mut buffer) {
                break Some(reason);
            }
        };

        if let Step::Stop(reason) = self.flush_outgoing() {
            trace!(target: TRANSPORT_TARGET, channel = %self.shared.label, reason, "final flush skipped");
        }
        if let Err(error) = self.conduit.shutdown() {
            trace!(target: TRANSPORT_TARGET, channel = %self.shared.label, %error, "shutdown failed");
        }
        if let Some(reason) = reason
            && self.shared.finish(&reason)
        {
            debug!(target: TRANSPORT_TARGET, channel = %self.shared.label, reason, "channel closed");
        }
    }

    fn flush_outgoing(&mut self) -> Step {
        let mut wrote = false;
        loop {
            match self.outgoing.try_recv() {
                Ok(frame) => {
                    if let Err(error) = self.conduit.write_all(&frame) {
                        return Step::Stop(format!("write failed: {error}"));
                    }
                    wrote = true;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        if wrote && let Err(error) = self.conduit.flush() {
            return Step::Stop(format!("flush failed: {error}"));
        }
        Step::Continue
    }

    fn read_once(&mut self, decoder: &mut FrameDecoder, buffer: &mut [u8]) -> Step {
        let read = match self.conduit.read(buffer) {
            Ok(0) => return Step::Stop("peer closed the connection".to_owned()),
            Ok(read) => read,
            Err(error) if is_poll_timeout(&error) => return Step::Continue,
            Err(error) => return Step::Stop(format!("read failed: {error}")),
        };
        decoder.push(buffer.get(..read).unwrap_or_default());
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => self.dispatch(&frame),
                Ok(None) => return Step::Continue,
                Err(error) => return Step::Stop(format!("framing error: {error}")),
            }
        }
    }

    fn dispatch(&self, frame: &[u8]) {
        match Message::parse(frame) {
            Ok(Message::Response(response)) => self.shared.complete(response),
            Ok(Message::Request(request)) => self.spawn_handler(Incoming::Request(request)),
            Ok(Message::Notification(notification)) => {
                self.spawn_handler(Incoming::Notification(notification));
            }
            Err(error) => {
                warn!(
                    target: TRANSPORT_TARGET,
                    channel = %self.shared.label,
                    %error,
                    "discarding unparseable message"
                );
                let channel = Channel {
                    shared: Arc::clone(&self.shared),
                };
                let response =
                    Response::failure(None, RpcError::new(PARSE_ERROR, error.to_string()));
                if let Err(send_error) = channel.send(&response) {
                    trace!(target: TRANSPORT_TARGET, %send_error, "parse error not delivered");
                }
            }
        }
    }

    fn spawn_handler(&self, incoming: Incoming) {
        let channel = Channel {
            shared: Arc::clone(&self.shared),
        };
        let handler = Arc::clone(&self.handler);
        let spawned = thread::Builder::new()
            .name(format!("switchboard-call-{}", self.shared.label))
            .spawn(move || serve_incoming(&channel, handler.as_ref(), incoming));
        if let Err(error) = spawned {
            warn!(
                target: TRANSPORT_TARGET,
                channel = %self.shared.label,
                %error,
                "failed to spawn call handler"
            );
        }
    }
}

enum Incoming {
    Request(Request),
    Notification(Notification),
}

fn serve_incoming(channel: &Channel, handler: &dyn RequestHandler, incoming: Incoming) {
    match incoming {
        Incoming::Request(request) => {
            let result = invoke(channel, handler, &request.method, request.params);
            let response = match result {
                Ok(value) => Response::success(request.id, value),
                Err(error) => Response::failure(Some(request.id), error),
            };
            if let Err(error) = channel.send(&response) {
                debug!(
                    target: TRANSPORT_TARGET,
                    channel = channel.label(),
                    id = request.id,
                    %error,
                    "response not delivered"
                );
            }
        }
        Incoming::Notification(notification) => {
            let method = notification.method;
            if let Err(error) = invoke(channel, handler, &method, notification.params) {
                debug!(
                    target: TRANSPORT_TARGET,
                    channel = channel.label(),
                    method,
                    code = error.code,
                    message = error.message,
                    "notification handler failed"
                );
            }
        }
    }
}

fn invoke(
    channel: &Channel,
    handler: &dyn RequestHandler,
    method: &str,
    params: Option<Value>,
) -> Result<Value, RpcError> {
    if method == PING_METHOD {
        return Ok(Value::String("pong".to_owned()));
    }
    let arguments = params.unwrap_or(Value::Null);
    panic::catch_unwind(AssertUnwindSafe(|| handler.handle(method, arguments, channel)))
        .unwrap_or_else(|payload| {
            Err(RpcError::internal(format!(
                "handler for '{method}' panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
}

/// Extracts the message carried by a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned())
}
