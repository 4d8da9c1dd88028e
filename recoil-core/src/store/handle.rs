//! State Handles
//!
//! A [`RecoilState`] is the consumer-facing view of one node in one
//! store: it holds the latest resolved value, a load status, and the
//! callbacks to run when either changes. Handles are what UI bindings
//! and services hold on to; they never touch the store's maps directly.
//!
//! # Status Machine
//!
//! ```text
//! Unattached --attach--> Loading --resolve ok--> Loaded
//!                           |                       |
//!                           +---resolve err--> Error |
//!                                                    v
//!     any state ----dispose----------------> Disposed (terminal)
//! ```
//!
//! A write puts the handle back into `Loading` with the written value
//! already visible (optimistic), then settles to `Loaded` or `Error`
//! once the store write completes. Detaching returns to `Unattached`
//! but keeps the last value for display.
//!
//! # Staleness
//!
//! Resolutions run as spawned tasks and can finish after the handle has
//! moved on. Every async path snapshots an epoch counter first and
//! [`StateInner::install`] drops results whose epoch is no longer
//! current; attach, detach and dispose bump the epoch.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::error::{RecoilError, RecoilResult};
use crate::node::{NodeId, NodeRef, RecoilValue, StateValue};
use crate::store::observer::{InlineExecutor, NotifyExecutor, Subscription, SubscriptionId};
use crate::store::store::{RecoilStore, StoredValue};

/// Unique identifier for a state handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl HandleId {
    /// Generate a new unique handle ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a handle is in its load lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    /// Not attached to any store; only local values are visible.
    Unattached,
    /// A resolution or write is in flight.
    Loading,
    /// The value reflects the attached store.
    Loaded,
    /// The last resolution or write failed; see [`RecoilState::error`].
    Error,
    /// The handle was disposed and will never update again.
    Disposed,
}

/// One observable state of a handle: the value and how fresh it is.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleSnapshot<T: StateValue> {
    /// The latest known value, if any resolution or write produced one.
    pub value: Option<T>,
    /// The handle's load status at snapshot time.
    pub status: HandleStatus,
}

#[derive(Clone)]
struct CallbackEntry<T: StateValue> {
    id: SubscriptionId,
    callback: Arc<dyn Fn(HandleSnapshot<T>) + Send + Sync>,
    executor: Arc<dyn NotifyExecutor>,
}

struct HandleCore<T: StateValue> {
    value: Option<T>,
    status: HandleStatus,
    error: Option<Arc<RecoilError>>,
    store: Option<RecoilStore>,
}

impl<T: StateValue> HandleCore<T> {
    fn snapshot(&self) -> HandleSnapshot<T> {
        HandleSnapshot {
            value: self.value.clone(),
            status: self.status,
        }
    }
}

pub(crate) struct StateInner<T: StateValue> {
    id: HandleId,
    node: Arc<dyn RecoilValue<T>>,
    node_ref: NodeRef,
    core: RwLock<HandleCore<T>>,
    epoch: AtomicU64,
    callbacks: RwLock<Vec<CallbackEntry<T>>>,
    watch_tx: watch::Sender<HandleSnapshot<T>>,
}

impl<T: StateValue> StateInner<T> {
    fn is_bound_to(&self, store: &RecoilStore) -> bool {
        self.core.read().store.as_ref().map(|s| s.id()) == Some(store.id())
    }

    /// Apply a resolution outcome, unless the handle has moved on.
    fn install(&self, epoch: u64, result: RecoilResult<T>) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::trace!(key = self.node_ref.key(), "stale resolution dropped");
            return;
        }

        let snapshot = {
            let mut core = self.core.write();
            if core.status == HandleStatus::Disposed {
                return;
            }
            match result {
                Ok(value) => {
                    if core.status == HandleStatus::Loaded && core.value.as_ref() == Some(&value) {
                        return;
                    }
                    core.value = Some(value);
                    core.status = HandleStatus::Loaded;
                    core.error = None;
                }
                Err(error) => {
                    // The last good value stays visible next to the error.
                    core.status = HandleStatus::Error;
                    core.error = Some(Arc::new(error));
                }
            }
            core.snapshot()
        };
        self.publish(snapshot);
    }

    fn publish(&self, snapshot: HandleSnapshot<T>) {
        self.watch_tx.send_replace(snapshot.clone());

        let callbacks: Vec<CallbackEntry<T>> = self.callbacks.read().clone();
        for entry in callbacks {
            let CallbackEntry {
                callback, executor, ..
            } = entry;
            let snapshot = snapshot.clone();
            executor.execute(Box::new(move || callback(snapshot)));
        }
    }

    fn publish_current(&self) {
        let snapshot = self.core.read().snapshot();
        self.publish(snapshot);
    }

    async fn reload_at(&self, store: &RecoilStore, epoch: u64) {
        let result = self.node.get_value(store).await;
        self.install(epoch, result);
    }

    /// Write through to the store, then settle the handle.
    ///
    /// A reload follows even an equal-value no-op write, since no store
    /// notification will arrive to move us out of `Loading`.
    async fn write_through(&self, store: &RecoilStore, value: T, epoch: u64) {
        match self.node.set_value(store, value).await {
            Ok(()) => self.reload_at(store, epoch).await,
            Err(error) => {
                tracing::debug!(key = self.node_ref.key(), %error, "state write failed");
                self.install(epoch, Err(error));
            }
        }
    }

    fn dispose(&self) {
        let store = {
            let mut core = self.core.write();
            if core.status == HandleStatus::Disposed {
                return;
            }
            core.status = HandleStatus::Disposed;
            core.value = None;
            core.error = None;
            core.store.take()
        };
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.callbacks.write().clear();
        if let Some(store) = store {
            store.detach_binding(self.id);
        }
        self.watch_tx.send_replace(HandleSnapshot {
            value: None,
            status: HandleStatus::Disposed,
        });
        tracing::debug!(key = self.node_ref.key(), "state handle disposed");
    }
}

/// Store-facing surface of an attached state handle.
pub(crate) trait StateBinding: Send + Sync {
    fn handle_id(&self) -> HandleId;
    fn node(&self) -> &NodeRef;
    fn node_id(&self) -> NodeId;
    /// The bound node's stored value changed; `None` means reset.
    fn pushed_value<'a>(
        &'a self,
        store: &'a RecoilStore,
        value: Option<&'a StoredValue>,
    ) -> BoxFuture<'a, ()>;
    /// A transitive source of the bound node changed.
    fn dependent_changed<'a>(&'a self, store: &'a RecoilStore) -> BoxFuture<'a, ()>;
}

impl<T: StateValue> StateBinding for StateInner<T> {
    fn handle_id(&self) -> HandleId {
        self.id
    }

    fn node(&self) -> &NodeRef {
        &self.node_ref
    }

    fn node_id(&self) -> NodeId {
        self.node_ref.id()
    }

    fn pushed_value<'a>(
        &'a self,
        store: &'a RecoilStore,
        value: Option<&'a StoredValue>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.is_bound_to(store) {
                return;
            }
            let epoch = self.epoch.load(Ordering::SeqCst);
            match value {
                Some(raw) => match raw.downcast::<T>() {
                    Some(value) => self.install(epoch, Ok(value)),
                    None => tracing::warn!(
                        key = self.node_ref.key(),
                        stored = raw.type_name(),
                        "pushed value had unexpected type"
                    ),
                },
                // Reset; re-resolve so the default chain applies.
                None => self.reload_at(store, epoch).await,
            }
        })
    }

    fn dependent_changed<'a>(&'a self, store: &'a RecoilStore) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.is_bound_to(store) {
                let epoch = self.epoch.load(Ordering::SeqCst);
                self.reload_at(store, epoch).await;
            }
        })
    }
}

/// A live view of one node's value in one store.
///
/// Create one detached with [`RecoilState::detached`] or already
/// attached with [`RecoilStore::use_state`]. Dropping the handle
/// disposes it and detaches it from its store.
pub struct RecoilState<T: StateValue> {
    inner: Arc<StateInner<T>>,
}

impl<T: StateValue> RecoilState<T> {
    /// Create a handle not yet attached to any store.
    pub fn detached<N>(node: &Arc<N>) -> Self
    where
        N: RecoilValue<T> + 'static,
    {
        let value_node: Arc<dyn RecoilValue<T>> = node.clone();
        let node_ref: NodeRef = node.clone();
        let (watch_tx, _) = watch::channel(HandleSnapshot {
            value: None,
            status: HandleStatus::Unattached,
        });
        Self {
            inner: Arc::new(StateInner {
                id: HandleId::new(),
                node: value_node,
                node_ref,
                core: RwLock::new(HandleCore {
                    value: None,
                    status: HandleStatus::Unattached,
                    error: None,
                    store: None,
                }),
                epoch: AtomicU64::new(0),
                callbacks: RwLock::new(Vec::new()),
                watch_tx,
            }),
        }
    }

    /// Attach to `store`, detaching from any previous store first.
    ///
    /// The initial resolution is spawned onto the current Tokio
    /// runtime; without one it is deferred until the first
    /// [`RecoilState::refresh`] or store change.
    pub fn attach(&self, store: &RecoilStore) -> RecoilResult<()> {
        self.detach();
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut core = self.inner.core.write();
            if core.status == HandleStatus::Disposed {
                return Err(RecoilError::InvalidArgument(
                    "state handle already disposed".to_string(),
                ));
            }
            core.store = Some(store.clone());
            core.status = HandleStatus::Loading;
        }

        let binding: Arc<dyn StateBinding> = self.inner.clone();
        if let Err(error) = store.attach_binding(binding) {
            let mut core = self.inner.core.write();
            core.store = None;
            core.status = HandleStatus::Unattached;
            return Err(error);
        }
        self.inner.publish_current();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                let store = store.clone();
                handle.spawn(async move {
                    inner.reload_at(&store, epoch).await;
                });
            }
            Err(_) => {
                tracing::debug!(
                    key = self.inner.node_ref.key(),
                    "no async runtime, initial load deferred"
                );
            }
        }
        Ok(())
    }

    /// Detach from the current store, keeping the last value visible.
    pub fn detach(&self) {
        let store = {
            let mut core = self.inner.core.write();
            let store = core.store.take();
            if store.is_some() && core.status != HandleStatus::Disposed {
                core.status = HandleStatus::Unattached;
            }
            store
        };
        let Some(store) = store else { return };

        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        store.detach_binding(self.inner.id);
        self.inner.publish_current();
        tracing::debug!(
            key = self.inner.node_ref.key(),
            store = store.id().raw(),
            "state handle detached"
        );
    }

    /// Dispose the handle; it detaches, clears, and never updates again.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// This handle's identity, for diagnostics.
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// Key of the bound node.
    pub fn key(&self) -> &str {
        self.inner.node_ref.key()
    }

    /// The latest known value, if any.
    pub fn value(&self) -> Option<T> {
        self.inner.core.read().value.clone()
    }

    /// The current load status.
    pub fn status(&self) -> HandleStatus {
        self.inner.core.read().status
    }

    /// Whether a resolution or write is in flight.
    pub fn is_loading(&self) -> bool {
        self.status() == HandleStatus::Loading
    }

    /// The failure behind an [`HandleStatus::Error`] status, if any.
    pub fn error(&self) -> Option<Arc<RecoilError>> {
        self.inner.core.read().error.clone()
    }

    /// Set the value optimistically, writing through in the background.
    ///
    /// The local value updates immediately. When attached, the store
    /// write is spawned onto the current Tokio runtime and the handle
    /// settles once it completes; without a runtime the write is
    /// skipped with a warning and the handle stays `Loading` until the
    /// next [`RecoilState::refresh`] or store change. When detached,
    /// only the local value changes. Failures surface through
    /// [`RecoilState::status`] and [`RecoilState::error`].
    pub fn set(&self, value: T) {
        let Some(store) = self.prepare_optimistic(value.clone()) else {
            return;
        };
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move {
                    inner.write_through(&store, value, epoch).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    key = self.inner.node_ref.key(),
                    "no async runtime, optimistic value not written through"
                );
            }
        }
    }

    /// Set the value and wait for the write to settle.
    pub async fn set_async(&self, value: T) {
        let Some(store) = self.prepare_optimistic(value.clone()) else {
            return;
        };
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.write_through(&store, value, epoch).await;
    }

    /// Apply the optimistic value; the attached store, if any, is where
    /// the write must go.
    fn prepare_optimistic(&self, value: T) -> Option<RecoilStore> {
        let (snapshot, store) = {
            let mut core = self.inner.core.write();
            if core.status == HandleStatus::Disposed {
                return None;
            }
            core.value = Some(value);
            let store = core.store.clone();
            if store.is_some() {
                core.status = HandleStatus::Loading;
            } else {
                tracing::debug!(
                    key = self.inner.node_ref.key(),
                    "set on unattached handle, keeping local value"
                );
            }
            (core.snapshot(), store)
        };
        self.inner.publish(snapshot);
        store
    }

    /// Re-resolve the bound node against the attached store now.
    pub async fn refresh(&self) {
        let store = self.inner.core.read().store.clone();
        let Some(store) = store else { return };
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.reload_at(&store, epoch).await;
    }

    /// Run `callback` inline on every snapshot change.
    pub fn on_change(
        &self,
        callback: impl Fn(HandleSnapshot<T>) + Send + Sync + 'static,
    ) -> Subscription {
        self.on_change_with(callback, Arc::new(InlineExecutor))
    }

    /// Run `callback` on `executor` on every snapshot change.
    pub fn on_change_with(
        &self,
        callback: impl Fn(HandleSnapshot<T>) + Send + Sync + 'static,
        executor: Arc<dyn NotifyExecutor>,
    ) -> Subscription {
        let id = SubscriptionId::new();
        self.inner.callbacks.write().push(CallbackEntry {
            id,
            callback: Arc::new(callback),
            executor,
        });
        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            inner.callbacks.write().retain(|entry| entry.id != id);
        })
    }

    /// A watch channel tracking this handle's snapshots.
    ///
    /// Useful for awaiting a state instead of polling:
    ///
    /// ```rust,ignore
    /// let mut rx = state.watch();
    /// rx.wait_for(|s| s.status == HandleStatus::Loaded).await?;
    /// ```
    pub fn watch(&self) -> watch::Receiver<HandleSnapshot<T>> {
        self.inner.watch_tx.subscribe()
    }
}

impl<T: StateValue> Drop for RecoilState<T> {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl<T: StateValue> fmt::Debug for RecoilState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.read();
        f.debug_struct("RecoilState")
            .field("key", &self.inner.node_ref.key())
            .field("status", &core.status)
            .field("value", &core.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Atom, Selector, ValueProvider};
    use std::sync::atomic::AtomicI32;

    #[test]
    fn detached_handle_reports_unattached() {
        let count = Atom::with_default("handle_count", 3).expect("atom");
        let state = RecoilState::detached(&count);

        assert_eq!(state.status(), HandleStatus::Unattached);
        assert_eq!(state.value(), None);
        assert_eq!(state.key(), "handle_count");
    }

    #[test]
    fn set_on_detached_handle_keeps_local_value() {
        let count = Atom::with_default("local_count", 0).expect("atom");
        let state = RecoilState::detached(&count);

        state.set(42);

        assert_eq!(state.value(), Some(42));
        assert_eq!(state.status(), HandleStatus::Unattached);
    }

    #[test]
    fn set_without_a_runtime_keeps_the_optimistic_value() {
        let store = RecoilStore::new();
        let count = Atom::with_default("offline_count", 0).expect("atom");
        let state = RecoilState::detached(&count);
        state.attach(&store).expect("attach");

        state.set(3);

        // No runtime to write through on, so nothing settles the handle
        // and nothing reaches the store.
        assert_eq!(state.value(), Some(3));
        assert_eq!(state.status(), HandleStatus::Loading);
        assert!(!store.has_value("offline_count"));
    }

    #[tokio::test]
    async fn attach_resolves_the_initial_value() {
        let store = RecoilStore::new();
        let count = Atom::with_default("attach_count", 7).expect("atom");

        let state = store.use_state(&count).expect("use_state");
        let mut rx = state.watch();
        rx.wait_for(|s| s.status == HandleStatus::Loaded)
            .await
            .expect("loaded");

        assert_eq!(state.value(), Some(7));
    }

    #[tokio::test]
    async fn store_writes_push_into_the_handle() {
        let store = RecoilStore::new();
        let count = Atom::with_default("push_count", 0).expect("atom");

        let state = store.use_state(&count).expect("use_state");
        let mut rx = state.watch();
        rx.wait_for(|s| s.status == HandleStatus::Loaded)
            .await
            .expect("loaded");

        store.set_value_async(&count, 12).await.expect("set");
        rx.wait_for(|s| s.value == Some(12))
            .await
            .expect("pushed value");

        assert_eq!(state.status(), HandleStatus::Loaded);
    }

    #[tokio::test]
    async fn optimistic_set_is_visible_before_settling() {
        let store = RecoilStore::new();
        let count = Atom::with_default("optimistic_count", 0).expect("atom");
        let state = store.use_state(&count).expect("use_state");

        state.set(5);
        assert_eq!(state.value(), Some(5));

        let mut rx = state.watch();
        rx.wait_for(|s| s.status == HandleStatus::Loaded && s.value == Some(5))
            .await
            .expect("settled");
        assert_eq!(store.try_cached::<i32>("optimistic_count"), Some(5));
    }

    #[tokio::test]
    async fn set_async_settles_in_one_call() {
        let store = RecoilStore::new();
        let count = Atom::with_default("settle_count", 0).expect("atom");
        let state = store.use_state(&count).expect("use_state");

        state.set_async(9).await;

        assert_eq!(state.status(), HandleStatus::Loaded);
        assert_eq!(state.value(), Some(9));
    }

    #[tokio::test]
    async fn failed_write_surfaces_as_error_status() {
        let store = RecoilStore::new();
        let fixed = Selector::new("fixed_value", |_provider: ValueProvider| async move {
            Ok(1)
        })
        .expect("selector");
        let state = store.use_state(&fixed).expect("use_state");

        state.set_async(5).await;

        assert_eq!(state.status(), HandleStatus::Error);
        let error = state.error().expect("error");
        assert!(matches!(*error, RecoilError::NotMutable { .. }));
    }

    #[tokio::test]
    async fn refresh_settles_deterministically() {
        let store = RecoilStore::new();
        let count = Atom::with_default("refresh_count", 4).expect("atom");
        let state = RecoilState::detached(&count);

        state.attach(&store).expect("attach");
        state.refresh().await;

        assert_eq!(state.status(), HandleStatus::Loaded);
        assert_eq!(state.value(), Some(4));
    }

    #[tokio::test]
    async fn disposed_handle_ignores_store_changes() {
        let store = RecoilStore::new();
        let count = Atom::with_default("dispose_count", 0).expect("atom");
        let calls = Arc::new(AtomicI32::new(0));

        let state = store.use_state(&count).expect("use_state");
        state.refresh().await;
        let _sub = state.on_change({
            let calls = calls.clone();
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        state.dispose();
        assert_eq!(state.status(), HandleStatus::Disposed);
        assert_eq!(state.value(), None);

        let before = calls.load(Ordering::SeqCst);
        store.set_value_async(&count, 1).await.expect("set");
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn dropped_callback_subscription_stops_delivery() {
        let store = RecoilStore::new();
        let count = Atom::with_default("cb_count", 0).expect("atom");
        let calls = Arc::new(AtomicI32::new(0));

        let state = store.use_state(&count).expect("use_state");
        state.refresh().await;

        let sub = state.on_change({
            let calls = calls.clone();
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        store.set_value_async(&count, 1).await.expect("set");
        let after_first = calls.load(Ordering::SeqCst);
        assert!(after_first >= 1);

        drop(sub);
        store.set_value_async(&count, 2).await.expect("set again");
        assert_eq!(calls.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test]
    async fn detach_keeps_the_last_value() {
        let store = RecoilStore::new();
        let count = Atom::with_default("detach_count", 0).expect("atom");
        let state = store.use_state(&count).expect("use_state");

        state.set_async(21).await;
        state.detach();

        assert_eq!(state.status(), HandleStatus::Unattached);
        assert_eq!(state.value(), Some(21));

        // Store changes no longer reach the handle.
        store.set_value_async(&count, 99).await.expect("set");
        assert_eq!(state.value(), Some(21));
    }
}
