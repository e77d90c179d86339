//! Connected/disconnected state with change and disconnect observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

pub type ChangeHandler = Arc<dyn Fn(bool) + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Connection state machine shared by a transport and its pump tasks.
/// Transitions are edge-only: repeated connects or disconnects do nothing.
#[derive(Clone, Default)]
pub struct ConnectionState {
    inner: Arc<ConnectionInner>,
}

#[derive(Default)]
struct ConnectionInner {
    connected: AtomicBool,
    next_slot: AtomicU64,
    change: Mutex<HashMap<u64, ChangeHandler>>,
    disconnect: Mutex<HashMap<u64, DisconnectHandler>>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Flips to connected. Returns `false` when already connected.
    pub fn set_connected(&self) -> bool {
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return false;
        }
        for handler in self.change_snapshot() {
            handler(true);
        }
        true
    }

    /// Flips to disconnected, notifying change observers first and then the
    /// disconnect observers. Returns `false` when already disconnected.
    pub fn set_disconnected(&self, reason: &str) -> bool {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return false;
        }
        for handler in self.change_snapshot() {
            handler(false);
        }
        let disconnect: Vec<DisconnectHandler> =
            self.inner.disconnect.lock().values().cloned().collect();
        for handler in disconnect {
            handler(reason);
        }
        true
    }

    /// Registers a change observer and immediately replays the current state
    /// to it: a newly-attached observer must not have to wait for the next
    /// transition to learn the current status.
    pub fn on_change(&self, handler: ChangeHandler) -> HandlerGuard {
        let slot = self.inner.next_slot.fetch_add(1, Ordering::Relaxed);
        self.inner.change.lock().insert(slot, handler.clone());
        handler(self.connected());
        HandlerGuard {
            inner: Arc::downgrade(&self.inner),
            slot,
            list: HandlerList::Change,
        }
    }

    pub fn on_disconnect(&self, handler: DisconnectHandler) -> HandlerGuard {
        let slot = self.inner.next_slot.fetch_add(1, Ordering::Relaxed);
        self.inner.disconnect.lock().insert(slot, handler);
        HandlerGuard {
            inner: Arc::downgrade(&self.inner),
            slot,
            list: HandlerList::Disconnect,
        }
    }

    // Handlers are invoked outside the lock so an observer may register or
    // unregister others without deadlocking.
    fn change_snapshot(&self) -> Vec<ChangeHandler> {
        self.inner.change.lock().values().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum HandlerList {
    Change,
    Disconnect,
}

/// Unregistration token returned by observer registration.
pub struct HandlerGuard {
    inner: Weak<ConnectionInner>,
    slot: u64,
    list: HandlerList,
}

impl HandlerGuard {
    pub fn unregister(self) {
        if let Some(inner) = self.inner.upgrade() {
            match self.list {
                HandlerList::Change => {
                    inner.change.lock().remove(&self.slot);
                }
                HandlerList::Disconnect => {
                    inner.disconnect.lock().remove(&self.slot);
                }
            }
        }
    }
}
