//! Protocol client state machine.
//!
//! Frames, parses, and correlates the asynchronous newline-delimited JSON
//! stream arriving from the hypervisor in arbitrarily fragmented chunks.
//! Responses are matched to in-flight commands strictly in send order (the
//! protocol guarantees in-order command completion for a single writer, so
//! no request identifiers are needed); messages carrying an `event` field are
//! demultiplexed to a broadcast channel instead.
//!
//! The client owns no I/O. Inbound bytes arrive through [`QmpClient::feed`],
//! outbound lines leave through the writer channel bound with
//! [`QmpClient::set_writer`]; the `transport` module wires both to a launched
//! process.

use std::collections::VecDeque;

use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::messages::{ClientError, EventTimestamp, InboundMessage, QmpEvent};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One in-flight correlation record.
enum Pending {
    /// A caller-issued command awaiting its response.
    Command(oneshot::Sender<Result<Value, ClientError>>),
    /// The capabilities negotiation issued automatically on the greeting.
    Negotiation,
}

/// State machine for one logical protocol connection.
///
/// Reusable across processes: [`QmpClient::reset`] discards all per-connection
/// state when the underlying transport is replaced, while event and connected
/// subscriptions persist across resets.
pub struct QmpClient {
    buffer: Vec<u8>,
    seen_greeting: bool,
    pending: VecDeque<Pending>,
    writer: Option<mpsc::UnboundedSender<String>>,
    events_tx: broadcast::Sender<QmpEvent>,
    connected_tx: watch::Sender<bool>,
    /// Bumped on every reset; lets a stale transport reader detect that its
    /// connection has been torn down.
    generation: u64,
}

impl QmpClient {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            buffer: Vec::new(),
            seen_greeting: false,
            pending: VecDeque::new(),
            writer: None,
            events_tx,
            connected_tx: watch::Sender::new(false),
            generation: 0,
        }
    }

    /// Bind or unbind the outbound transport.
    pub fn set_writer(&mut self, writer: Option<mpsc::UnboundedSender<String>>) {
        self.writer = writer;
    }

    /// Subscribe to out-of-band protocol events, in arrival order.
    pub fn subscribe_events(&self) -> broadcast::Receiver<QmpEvent> {
        self.events_tx.subscribe()
    }

    /// Watch handle that flips to `true` once the handshake completes, and
    /// back to `false` on reset.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    /// Connection identifier for the currently buffered transport. See
    /// [`QmpClient::feed_from`].
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Discard all per-connection state: buffered input, handshake progress,
    /// and every pending correlation record. Discarded requests never
    /// fulfil; their receivers observe [`ClientError::ConnectionReset`].
    pub fn reset(&mut self) {
        if !self.pending.is_empty() {
            debug!(
                dropped = self.pending.len(),
                "discarding in-flight requests on connection reset"
            );
        }
        self.pending.clear();
        self.buffer.clear();
        self.seen_greeting = false;
        self.generation += 1;
        self.connected_tx.send_replace(false);
    }

    /// Serialize and send a command, registering a pending correlation
    /// record. The returned receiver resolves with the response payload, or
    /// with the structured error the hypervisor reported.
    ///
    /// The pending record is registered before the send is attempted, so a
    /// send failure (no writer bound) leaves an abandoned record in the
    /// queue until the next reset, mirroring single-writer FIFO semantics.
    pub fn execute(
        &mut self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<oneshot::Receiver<Result<Value, ClientError>>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.push_back(Pending::Command(tx));
        self.send_command(command, arguments)?;
        Ok(rx)
    }

    fn send_command(&mut self, command: &str, arguments: Option<Value>) -> Result<(), ClientError> {
        let writer = self.writer.as_ref().ok_or(ClientError::NotBound)?;

        let mut message = json!({ "execute": command });
        if let Some(arguments) = arguments {
            message["arguments"] = arguments;
        }
        let mut line = message.to_string();
        line.push('\n');

        debug!(command, "sending command");
        // A closed channel means the transport task is gone; treat it the
        // same as an unbound writer.
        writer.send(line).map_err(|_| ClientError::NotBound)
    }

    /// Append raw bytes and extract every complete message, in arrival
    /// order. Never blocks; tolerant of messages split across any number of
    /// calls and of multiple messages per call. An empty call is a no-op.
    pub fn feed(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            match std::str::from_utf8(&line[..newline]) {
                Ok(text) => {
                    let text = text.trim();
                    if !text.is_empty() {
                        self.handle_line(text);
                    }
                }
                Err(e) => warn!(error = %e, "dropping non-UTF-8 protocol frame"),
            }
        }
    }

    /// [`QmpClient::feed`], gated on a connection generation. Bytes from a
    /// transport that has since been reset are dropped, so a late read from
    /// a dead process can never leak into the next connection.
    pub(crate) fn feed_from(&mut self, generation: u64, bytes: &[u8]) {
        if generation != self.generation {
            debug!("dropping bytes from a stale transport");
            return;
        }
        self.feed(bytes);
    }

    fn handle_line(&mut self, line: &str) {
        let message: InboundMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                // Drop and continue: one malformed frame must not take down
                // the connection or subsequent valid messages.
                warn!(error = %e, "dropping malformed protocol frame");
                return;
            }
        };

        if !self.seen_greeting {
            match message {
                InboundMessage::Greeting { .. } => self.handle_greeting(),
                _ => debug!("ignoring message received before the greeting"),
            }
            return;
        }

        match message {
            InboundMessage::Greeting { .. } => debug!("ignoring duplicate greeting"),
            InboundMessage::Return { payload } => self.settle(Ok(payload)),
            InboundMessage::CommandError { error } => {
                self.settle(Err(ClientError::Protocol(error)));
            }
            InboundMessage::Event {
                event,
                data,
                timestamp,
            } => self.dispatch_event(event, data, timestamp),
        }
    }

    fn handle_greeting(&mut self) {
        debug!("greeting received, negotiating capabilities");
        self.seen_greeting = true;
        self.pending.push_back(Pending::Negotiation);
        if let Err(e) = self.send_command("qmp_capabilities", None) {
            error!(error = %e, "failed to send capabilities negotiation");
            self.pending.pop_back();
        }
    }

    fn settle(&mut self, result: Result<Value, ClientError>) {
        match self.pending.pop_front() {
            Some(Pending::Command(tx)) => {
                if tx.send(result).is_err() {
                    debug!("response arrived for an abandoned request");
                }
            }
            Some(Pending::Negotiation) => match result {
                Ok(_) => {
                    info!("protocol handshake complete");
                    self.connected_tx.send_replace(true);
                }
                Err(e) => error!(error = %e, "capabilities negotiation rejected"),
            },
            None => warn!("response received with no request in flight"),
        }
    }

    fn dispatch_event(&mut self, name: String, data: Value, timestamp: EventTimestamp) {
        debug!(event = %name, "protocol event");
        let _ = self.events_tx.send(QmpEvent {
            name,
            data,
            timestamp,
        });
    }
}

impl Default for QmpClient {
    fn default() -> Self {
        Self::new()
    }
}
