//! The transport boundary: request/response correlation, subscription
//! routing, and the inbound message demultiplexer shared by every carrier.
//!
//! Carriers (in-process channel, WebSocket, IPC) only supply framing and
//! pump tasks; everything protocol-shaped lives in [`LinkCore`] and is
//! exposed through the [`Transport`] trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use wavelink_proto::{
    CallKind, CallResult, ClientMessage, Id, ServerMessage, WireError,
};

use crate::connection::{ChangeHandler, ConnectionState, DisconnectHandler, HandlerGuard};
use crate::subscription::{CancelState, Subscription, SubscriptionItem, SubscriptionUpdate};

pub mod channel;
#[cfg(unix)]
pub mod ipc;
pub mod websocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Channel,
    WebSocket,
    Ipc,
}

impl TransportKind {
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Channel => "channel",
            TransportKind::WebSocket => "websocket",
            TransportKind::Ipc => "ipc",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// Forced-cancellation kind used to reject everything outstanding on
    /// disconnect; distinguishable from a remote error so callers can choose
    /// to reconnect and retry.
    #[error("transport disconnected: {0}")]
    Disconnected(String),
    /// A procedure result carrying the remote error payload verbatim.
    #[error("remote error: {0}")]
    Remote(Value),
    #[error("request id {0} is already in flight")]
    DuplicateId(Id),
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("transport setup failed: {0}")]
    Setup(String),
}

/// An invocation of a remote procedure. When `id` is `None` the transport
/// assigns the next id from its local counter.
#[derive(Debug, Clone)]
pub struct ProcedureCall {
    pub kind: CallKind,
    pub id: Option<Id>,
    pub path: String,
    pub input: Option<Value>,
}

impl ProcedureCall {
    pub fn query(path: impl Into<String>) -> Self {
        Self {
            kind: CallKind::Query,
            id: None,
            path: path.into(),
            input: None,
        }
    }

    pub fn mutation(path: impl Into<String>) -> Self {
        Self {
            kind: CallKind::Mutation,
            id: None,
            path: path.into(),
            input: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<Id>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

/// Opens a subscription. The id doubles as the subscription id for its
/// entire lifetime.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub id: Option<Id>,
    pub path: String,
    pub input: Option<Value>,
}

impl SubscribeRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            id: None,
            path: path.into(),
            input: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<Id>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

/// Out-of-band confirmation correlating a mutation's locally-predicted
/// sequence with the server's committed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckReceipt {
    pub id: Id,
    pub client_seq: u64,
    pub server_seq: u64,
}

pub type AckHandler = Arc<dyn Fn(AckReceipt) + Send + Sync>;

/// Routing counters, exposed for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub routed: u64,
    pub dropped: u64,
}

/// The boundary contract, implemented once per carrier and otherwise
/// identical.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Sends the call and awaits its single resolution. A remote error
    /// result surfaces as [`TransportError::Remote`]; disconnection rejects
    /// with [`TransportError::Disconnected`].
    async fn request(&self, call: ProcedureCall) -> Result<Value, TransportError>;

    /// Registers the stream before sending, so a push arriving ahead of the
    /// send's return value is never dropped.
    fn subscribe(&self, request: SubscribeRequest) -> Result<Subscription, TransportError>;

    /// Single settable slot consumed by the optimistic-update collaborator;
    /// each ack is delivered to it at most once.
    fn set_ack_handler(&self, handler: AckHandler);

    /// Asks the peer to replay `from_seq < server_seq <= to_seq` for the
    /// subscription. Fire-and-forget.
    fn request_missing(&self, id: &Id, from_seq: u64, to_seq: u64)
        -> Result<(), TransportError>;

    fn connected(&self) -> bool;
    fn connect(&self);
    fn disconnect(&self, reason: &str);
    fn on_connection_change(&self, handler: ChangeHandler) -> HandlerGuard;
    fn on_disconnect(&self, handler: DisconnectHandler) -> HandlerGuard;

    fn stats(&self) -> LinkStats;
}

/// Carrier seam: how encoded client messages leave the process. Sends are
/// synchronous and non-blocking (carriers drain an unbounded outbound
/// queue), so protocol state never waits on the network.
pub(crate) trait Wire: Send + Sync {
    fn send(&self, message: &ClientMessage) -> Result<(), TransportError>;
}

struct StreamEntry {
    tx: mpsc::UnboundedSender<SubscriptionItem>,
    cancel: Arc<CancelState>,
}

/// Shared per-connection protocol state: the pending-request table, the
/// subscription routing table, the ack slot, and the connection state
/// machine. Owned by exactly one transport; never ambient.
pub(crate) struct LinkCore {
    kind: TransportKind,
    // Handed to each subscription's cancel token; a Weak so a lingering
    // token cannot keep the core alive after the transport is dropped.
    self_weak: Weak<LinkCore>,
    wire: Box<dyn Wire>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<Id, oneshot::Sender<Result<Value, TransportError>>>>,
    streams: Mutex<HashMap<Id, StreamEntry>>,
    ack_handler: Mutex<Option<AckHandler>>,
    connection: ConnectionState,
    routed: AtomicU64,
    dropped: AtomicU64,
}

impl LinkCore {
    pub(crate) fn new(kind: TransportKind, wire: Box<dyn Wire>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            kind,
            self_weak: weak.clone(),
            wire,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            ack_handler: Mutex::new(None),
            connection: ConnectionState::new(),
            routed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub(crate) fn mark_connected(&self) {
        self.connection.set_connected();
    }

    fn next_id(&self) -> Id {
        Id::Num(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) async fn request(&self, call: ProcedureCall) -> Result<Value, TransportError> {
        if !self.connection.connected() {
            return Err(TransportError::Disconnected(
                "transport is not connected".into(),
            ));
        }
        let id = call.id.unwrap_or_else(|| self.next_id());
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&id) {
                warn!(
                    target = "wavelink::transport",
                    id = %id,
                    "rejecting call whose id is already in flight"
                );
                return Err(TransportError::DuplicateId(id));
            }
            pending.insert(id.clone(), tx);
        }
        // disconnect() may have drained the table between the connected
        // check and the insert; a parked entry would strand the caller.
        if !self.connection.connected() {
            self.pending.lock().remove(&id);
            return Err(TransportError::Disconnected(
                "transport is not connected".into(),
            ));
        }

        let message = ClientMessage::Call {
            kind: call.kind,
            id: id.clone(),
            path: call.path,
            input: call.input,
        };
        if let Err(err) = self.wire.send(&message) {
            // Never sent; reject immediately and forget the entry.
            self.pending.lock().remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::ChannelClosed),
        }
    }

    pub(crate) fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<Subscription, TransportError> {
        if !self.connection.connected() {
            return Err(TransportError::Disconnected(
                "transport is not connected".into(),
            ));
        }
        let id = request.id.unwrap_or_else(|| self.next_id());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancelState::new(id.clone(), self.self_weak.clone());
        {
            let mut streams = self.streams.lock();
            if streams.contains_key(&id) {
                warn!(
                    target = "wavelink::transport",
                    id = %id,
                    "rejecting subscribe whose id is already active"
                );
                return Err(TransportError::DuplicateId(id));
            }
            streams.insert(
                id.clone(),
                StreamEntry {
                    tx,
                    cancel: cancel.clone(),
                },
            );
        }
        // Same window as request(): a disconnect cascade racing this insert
        // must not leave the stream entry parked in the routing table.
        if !self.connection.connected() {
            self.streams.lock().remove(&id);
            cancel.finish();
            return Err(TransportError::Disconnected(
                "transport is not connected".into(),
            ));
        }

        let message = ClientMessage::Subscribe {
            id: id.clone(),
            path: request.path,
            input: request.input,
        };
        if let Err(err) = self.wire.send(&message) {
            self.streams.lock().remove(&id);
            cancel.finish();
            return Err(err);
        }
        Ok(Subscription::new(id, rx, cancel))
    }

    pub(crate) fn set_ack_handler(&self, handler: AckHandler) {
        *self.ack_handler.lock() = Some(handler);
    }

    pub(crate) fn request_missing(
        &self,
        id: &Id,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<(), TransportError> {
        self.wire.send(&ClientMessage::RequestMissing {
            id: id.clone(),
            from_seq,
            to_seq,
        })
    }

    /// Consumer-initiated teardown of one subscription: deregister from the
    /// routing table, then tell the peer, unless the connection is already
    /// gone, in which case the disconnect cascade has done the work.
    pub(crate) fn cancel_subscription(&self, id: &Id) {
        self.streams.lock().remove(id);
        if !self.connection.connected() {
            return;
        }
        let message = ClientMessage::Unsubscribe { id: id.clone() };
        if let Err(err) = self.wire.send(&message) {
            warn!(
                target = "wavelink::transport",
                id = %id,
                error = %err,
                "failed to send unsubscribe"
            );
        }
    }

    /// Routes one inbound message. Called by the carrier's pump in arrival
    /// order, synchronously, one message at a time; never panics and never
    /// reports an error back to the pump.
    pub(crate) fn handle_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Result { id, result } => {
                let sender = self.pending.lock().remove(&id);
                match sender {
                    Some(sender) => {
                        self.routed.fetch_add(1, Ordering::Relaxed);
                        let outcome = match result {
                            CallResult::Data { value } => Ok(value),
                            CallResult::Error { error } => Err(TransportError::Remote(error)),
                        };
                        // The caller may have stopped waiting; that is its
                        // business, not an error here.
                        let _ = sender.send(outcome);
                    }
                    None => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            target = "wavelink::demux",
                            id = %id,
                            "result for unknown request id; dropping"
                        );
                    }
                }
            }
            ServerMessage::Ack {
                id,
                client_seq,
                server_seq,
            } => {
                let handler = self.ack_handler.lock().clone();
                match handler {
                    Some(handler) => {
                        self.routed.fetch_add(1, Ordering::Relaxed);
                        handler(AckReceipt {
                            id,
                            client_seq,
                            server_seq,
                        });
                    }
                    None => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            target = "wavelink::demux",
                            id = %id,
                            client_seq,
                            "ack with no registered handler; dropping"
                        );
                    }
                }
            }
            ServerMessage::Data(data) => {
                let streams = self.streams.lock();
                match streams.get(&data.id) {
                    Some(entry) => {
                        self.routed.fetch_add(1, Ordering::Relaxed);
                        let item = SubscriptionItem::Data(SubscriptionUpdate {
                            data: data.data,
                            server_seq: data.server_seq,
                            prev_server_seq: data.prev_server_seq,
                        });
                        if entry.tx.send(item).is_err() {
                            trace!(
                                target = "wavelink::demux",
                                id = %data.id,
                                "subscription consumer gone; dropping update"
                            );
                        }
                    }
                    None => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            target = "wavelink::demux",
                            id = %data.id,
                            server_seq = data.server_seq,
                            "data for unknown subscription; dropping"
                        );
                    }
                }
            }
            ServerMessage::Error { id, error } => {
                let entry = self.streams.lock().remove(&id);
                match entry {
                    Some(entry) => {
                        self.routed.fetch_add(1, Ordering::Relaxed);
                        entry.cancel.finish();
                        // Terminal: the sender drops right after the error
                        // item, ending the stream once buffers drain.
                        let _ = entry.tx.send(SubscriptionItem::Error(error));
                    }
                    None => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            target = "wavelink::demux",
                            id = %id,
                            "error for unknown subscription; dropping"
                        );
                    }
                }
            }
            ServerMessage::End { id } => {
                let entry = self.streams.lock().remove(&id);
                match entry {
                    Some(entry) => {
                        self.routed.fetch_add(1, Ordering::Relaxed);
                        // Dropping the sender is the graceful end signal.
                        entry.cancel.finish();
                    }
                    None => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            target = "wavelink::demux",
                            id = %id,
                            "end for unknown subscription; dropping"
                        );
                    }
                }
            }
        }
    }

    /// Unconditional teardown: rejects every pending request with a
    /// disconnected-kind error and drives every open stream to completion.
    /// Idempotent; repeated calls fall out at the edge check.
    pub(crate) fn disconnect(&self, reason: &str) {
        if !self.connection.set_disconnected(reason) {
            return;
        }
        debug!(
            target = "wavelink::transport",
            kind = self.kind.label(),
            reason,
            "disconnect cascade"
        );
        let pending: Vec<(Id, oneshot::Sender<Result<Value, TransportError>>)> =
            self.pending.lock().drain().collect();
        for (_, sender) in pending {
            let _ = sender.send(Err(TransportError::Disconnected(reason.to_string())));
        }
        let streams: Vec<(Id, StreamEntry)> = self.streams.lock().drain().collect();
        for (_, entry) in streams {
            // Buffered items remain deliverable; dropping the sender ends
            // each stream only after its queue drains.
            entry.cancel.finish();
        }
    }

    pub(crate) fn stats(&self) -> LinkStats {
        LinkStats {
            routed: self.routed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn active_streams(&self) -> usize {
        self.streams.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Client half of a connection over any carrier. Owns the pump tasks; they
/// are aborted when the transport is dropped.
pub struct ClientTransport {
    core: Arc<LinkCore>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClientTransport {
    pub(crate) fn new(core: Arc<LinkCore>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { core, tasks }
    }
}

#[async_trait]
impl Transport for ClientTransport {
    fn kind(&self) -> TransportKind {
        self.core.kind
    }

    async fn request(&self, call: ProcedureCall) -> Result<Value, TransportError> {
        self.core.request(call).await
    }

    fn subscribe(&self, request: SubscribeRequest) -> Result<Subscription, TransportError> {
        self.core.subscribe(request)
    }

    fn set_ack_handler(&self, handler: AckHandler) {
        self.core.set_ack_handler(handler);
    }

    fn request_missing(
        &self,
        id: &Id,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<(), TransportError> {
        self.core.request_missing(id, from_seq, to_seq)
    }

    fn connected(&self) -> bool {
        self.core.connection.connected()
    }

    fn connect(&self) {
        self.core.mark_connected();
    }

    fn disconnect(&self, reason: &str) {
        self.core.disconnect(reason);
    }

    fn on_connection_change(&self, handler: ChangeHandler) -> HandlerGuard {
        self.core.connection.on_change(handler)
    }

    fn on_disconnect(&self, handler: DisconnectHandler) -> HandlerGuard {
        self.core.connection.on_disconnect(handler)
    }

    fn stats(&self) -> LinkStats {
        self.core.stats()
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
