//! Client-side consumption primitive for one subscription.
//!
//! Updates are pushed by the demultiplexer as they arrive and buffered in an
//! unbounded queue; the consumer pulls them with [`Subscription::recv`]. The
//! queue deliberately has no backpressure signal to the publisher; a slow
//! consumer never blocks delivery (see DESIGN.md).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use wavelink_proto::Id;

use crate::transport::LinkCore;

/// One sequenced update delivered on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUpdate {
    pub data: Value,
    pub server_seq: u64,
    pub prev_server_seq: Option<u64>,
}

impl SubscriptionUpdate {
    /// Whether this update logically follows `last_seen`. Updates that name
    /// no predecessor are always considered in sequence; callers that see
    /// `false` can ask the transport to fill the gap.
    pub fn follows(&self, last_seen: u64) -> bool {
        self.prev_server_seq
            .map_or(true, |prev| prev == last_seen)
    }
}

/// Items yielded by a subscription stream. An `Error` item is terminal: the
/// stream completes right after yielding it.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionItem {
    Data(SubscriptionUpdate),
    Error(Value),
}

/// Shared once-guard for a subscription's terminal event. Whichever side
/// observes the terminal condition first (remote end/error, local
/// unsubscribe, disconnect) wins; everything after is a no-op.
pub(crate) struct CancelState {
    id: Id,
    done: AtomicBool,
    core: Weak<LinkCore>,
}

impl CancelState {
    pub(crate) fn new(id: Id, core: Weak<LinkCore>) -> Arc<Self> {
        Arc::new(Self {
            id,
            done: AtomicBool::new(false),
            core,
        })
    }

    /// Marks the subscription terminated without emitting an unsubscribe
    /// frame. Used for remote end/error and disconnect teardown.
    pub(crate) fn finish(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    /// Consumer-initiated cancellation: deregisters the stream and sends the
    /// unsubscribe frame, at most once across all callers.
    pub(crate) fn cancel(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            core.cancel_subscription(&self.id);
        }
    }
}

/// An active subscription: pull side of the stream plus its cancellation
/// token. Dropping the subscription cancels it.
pub struct Subscription {
    id: Id,
    rx: mpsc::UnboundedReceiver<SubscriptionItem>,
    cancel: Arc<CancelState>,
}

impl Subscription {
    pub(crate) fn new(
        id: Id,
        rx: mpsc::UnboundedReceiver<SubscriptionItem>,
        cancel: Arc<CancelState>,
    ) -> Self {
        Self { id, rx, cancel }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Next item in arrival order. Returns `None` only once the stream has
    /// terminated *and* every buffered item has been delivered; an `end()`
    /// racing ahead of delivery never swallows buffered updates.
    pub async fn recv(&mut self) -> Option<SubscriptionItem> {
        let item = self.rx.recv().await;
        if item.is_none() {
            // Natural completion; a later unsubscribe must not emit a frame.
            self.cancel.finish();
        }
        item
    }

    /// Cancels the subscription: ends the stream locally, deregisters it
    /// from the transport's routing table, and sends the unsubscribe frame
    /// to the peer at most once. Safe to call repeatedly and after natural
    /// termination.
    pub fn unsubscribe(&mut self) {
        self.cancel.cancel();
    }

    /// Detached cancellation token, for callers that need to cancel from
    /// somewhere other than the consuming task.
    pub fn canceller(&self) -> SubscriptionCanceller {
        SubscriptionCanceller {
            cancel: self.cancel.clone(),
        }
    }

    /// Consumer-side failure injection: performs the full cancellation
    /// sequence, then hands the reason back for propagation.
    pub fn abort(mut self, reason: anyhow::Error) -> anyhow::Error {
        self.unsubscribe();
        reason
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub struct SubscriptionCanceller {
    cancel: Arc<CancelState>,
}

impl SubscriptionCanceller {
    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }
}
