//! Store Observers
//!
//! External collaborators subscribe to a store and hear about every
//! effective value change, once per change, after all bound state
//! handles have been brought up to date. Delivery runs through a
//! pluggable [`NotifyExecutor`] so a collaborator can marshal callbacks
//! onto its own execution context; lifecycle hooks always run inline.
//!
//! Subscriptions are explicit: [`Subscription`] is a guard that cancels
//! on drop, so an observer is delivered to exactly as long as someone
//! holds the guard.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::node::NodeRef;
use crate::store::store::StoredValue;
use crate::store::RecoilStore;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Generate a new unique subscription ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// One value change, as delivered to observers.
#[derive(Clone)]
pub struct ValueChange {
    /// The node whose stored value changed.
    pub node: NodeRef,
    /// The new stored value; `None` means the entry was reset.
    pub value: Option<StoredValue>,
    /// The transitive dependents of the changed node at notification
    /// time, in propagation order.
    pub dependents: Arc<[NodeRef]>,
}

impl fmt::Debug for ValueChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueChange")
            .field("key", &self.node.key())
            .field("value", &self.value)
            .field("dependents", &self.dependents.len())
            .finish()
    }
}

/// Observer of a store's value changes and handle lifecycle.
pub trait StoreObserver: Send + Sync {
    /// Called once when the observer is attached to a store.
    fn on_attached(&self, _store: &RecoilStore) {}

    /// Called when a state handle attaches to the store.
    fn on_handle_attached(&self, _store: &RecoilStore, _node: &NodeRef) {}

    /// Called when a state handle detaches from the store.
    fn on_handle_detached(&self, _store: &RecoilStore, _node: &NodeRef) {}

    /// Called after every effective value change, once per change, after
    /// all state handles have been notified.
    fn on_value_changed(&self, store: &RecoilStore, change: &ValueChange);
}

/// Execution context for observer and handle callbacks.
pub trait NotifyExecutor: Send + Sync {
    /// Run one notification task.
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs notifications synchronously on the notifying thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl NotifyExecutor for InlineExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// Runs notifications on a freshly spawned runtime task.
///
/// Falls back to inline execution when no Tokio runtime is active.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskExecutor;

impl NotifyExecutor for TaskExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { task() });
            }
            Err(_) => task(),
        }
    }
}

/// Guard for an active subscription; dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately cancels it"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel the subscription now instead of at drop time.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::time::Duration;

    #[test]
    fn subscription_ids_are_unique() {
        assert_ne!(SubscriptionId::new(), SubscriptionId::new());
    }

    #[test]
    fn inline_executor_runs_immediately() {
        let count = Arc::new(AtomicI32::new(0));
        let count_clone = count.clone();

        InlineExecutor.execute(Box::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn task_executor_falls_back_inline_without_runtime() {
        let count = Arc::new(AtomicI32::new(0));
        let count_clone = count.clone();

        TaskExecutor.execute(Box::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn task_executor_spawns_on_runtime() {
        let count = Arc::new(AtomicI32::new(0));
        let count_clone = count.clone();

        TaskExecutor.execute(Box::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        // The task runs once the runtime gets control back.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_cancels() {
        let count = Arc::new(AtomicI32::new(0));
        let count_clone = count.clone();

        let subscription = Subscription::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(subscription);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_cancel_runs_once() {
        let count = Arc::new(AtomicI32::new(0));
        let count_clone = count.clone();

        let subscription = Subscription::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        subscription.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
