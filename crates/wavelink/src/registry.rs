//! Server-side bookkeeping for active subscriptions.
//!
//! The registry maps a subscription id to the cleanup action that tears it
//! down. Cleanups are normalized to one deferred form at the boundary: a
//! synchronous closure is wrapped trivially, so the registry never has to
//! distinguish the two at teardown time.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::warn;
use wavelink_proto::Id;

type CleanupFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Deferred teardown action for one subscription.
pub struct Cleanup(CleanupFuture);

impl Cleanup {
    pub fn from_fn(action: impl FnOnce() -> anyhow::Result<()> + Send + 'static) -> Self {
        Self(Box::pin(async move { action() }))
    }

    pub fn from_future(future: impl Future<Output = anyhow::Result<()>> + Send + 'static) -> Self {
        Self(Box::pin(future))
    }

    pub fn noop() -> Self {
        Self(Box::pin(async { Ok(()) }))
    }

    /// Runs the cleanup. Failures and panics are logged and contained; a
    /// broken cleanup must never block deregistration of other
    /// subscriptions.
    async fn run(self, id: &Id) {
        match AssertUnwindSafe(self.0).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(
                target = "wavelink::registry",
                id = %id,
                error = %err,
                "subscription cleanup failed"
            ),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                warn!(
                    target = "wavelink::registry",
                    id = %id,
                    reason = %reason,
                    "subscription cleanup panicked"
                );
            }
        }
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cleanup")
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<Id, Cleanup>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `cleanup` for `id`. A duplicate id is a protocol violation
    /// (duplicate subscribe request); the previous cleanup runs before the
    /// new one is stored so the earlier subscription's resources are not
    /// leaked.
    pub async fn register(&self, id: Id, cleanup: Cleanup) {
        let previous = self.entries.lock().remove(&id);
        if let Some(previous) = previous {
            warn!(
                target = "wavelink::registry",
                id = %id,
                "duplicate subscription id; tearing down previous subscription"
            );
            previous.run(&id).await;
        }
        self.entries.lock().insert(id, cleanup);
    }

    /// Removes `id` and runs its cleanup. Unknown ids are a warned no-op.
    pub async fn deregister(&self, id: &Id) {
        let entry = self.entries.lock().remove(id);
        match entry {
            Some(cleanup) => cleanup.run(id).await,
            None => warn!(
                target = "wavelink::registry",
                id = %id,
                "deregister for unknown subscription id"
            ),
        }
    }

    pub fn exists(&self, id: &Id) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Removes and runs every cleanup. Used by connection teardown.
    pub async fn drain(&self) {
        let entries: Vec<(Id, Cleanup)> = self.entries.lock().drain().collect();
        for (id, cleanup) in entries {
            cleanup.run(&id).await;
        }
    }
}
