//! Recoil Store
//!
//! The store is the container all state actually lives in. Nodes are
//! definitions; a store pairs them with values, so the same atom can
//! hold different values in different stores.
//!
//! # What a Store Holds
//!
//! - A key to stored-value map. Atom entries appear on first explicit
//!   set, never from defaults. Selector entries are memoized results.
//! - A key to node registry, so two different node instances can never
//!   share a key inside one store.
//! - The state handles currently attached ([`super::RecoilState`]).
//! - Subscribed observers ([`super::StoreObserver`]).
//!
//! # The Set Protocol
//!
//! [`RecoilStore::set_value_async`] is the write path everything funnels
//! through, including writable selector setters:
//!
//! 1. Register the atom (collision check).
//! 2. Compare against the stored value; an equal write is a complete
//!    no-op and reports `false`.
//! 3. Run the atom's effects with the old and new values.
//! 4. Store the new value.
//! 5. Evict memoized selector results in the dependent closure.
//! 6. Push the value to handles bound to the atom, then re-resolve
//!    handles bound to any transitive dependent.
//! 7. Tell observers, each through its own executor.
//!
//! Each step sees the previous one completed; handles always settle
//! before observers hear about the change.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexSet;
use parking_lot::RwLock;

use crate::error::{RecoilError, RecoilResult};
use crate::node::{Atom, NodeId, NodeKind, NodeRef, RecoilNode, RecoilValue, StateValue, WeakNode};
use crate::store::handle::{HandleId, RecoilState, StateBinding};
use crate::store::observer::{
    InlineExecutor, NotifyExecutor, StoreObserver, Subscription, SubscriptionId, ValueChange,
};
use crate::store::propagation;

/// Unique identifier for a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreId(u64);

impl StoreId {
    /// Generate a new unique store ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for StoreId {
    fn default() -> Self {
        Self::new()
    }
}

/// A type-erased stored value. Cloning is cheap.
#[derive(Clone)]
pub struct StoredValue {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl StoredValue {
    pub(crate) fn new<T: StateValue>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Clone the value back out at its concrete type.
    pub fn downcast<T: StateValue>(&self) -> Option<T> {
        self.value.downcast_ref::<T>().cloned()
    }

    /// Name of the stored concrete type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for StoredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredValue")
            .field("type", &self.type_name)
            .finish()
    }
}

/// The store's claim on a key.
struct NodeRegistration {
    id: NodeId,
    kind: NodeKind,
    node: WeakNode,
}

#[derive(Clone)]
struct ObserverEntry {
    id: SubscriptionId,
    observer: Arc<dyn StoreObserver>,
    executor: Arc<dyn NotifyExecutor>,
}

struct StoreInner {
    id: StoreId,
    values: DashMap<String, StoredValue>,
    registry: DashMap<String, NodeRegistration>,
    bindings: RwLock<Vec<Arc<dyn StateBinding>>>,
    observers: RwLock<Vec<ObserverEntry>>,
}

/// A container of state values for a set of nodes.
///
/// Cloning a `RecoilStore` is cheap and yields a handle to the same
/// store; independent stores come from separate [`RecoilStore::new`]
/// calls and never share values, even for the same node instances.
pub struct RecoilStore {
    inner: Arc<StoreInner>,
}

impl Clone for RecoilStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for RecoilStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoilStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                id: StoreId::new(),
                values: DashMap::new(),
                registry: DashMap::new(),
                bindings: RwLock::new(Vec::new()),
                observers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Create a store with observers attached for its whole lifetime.
    ///
    /// Lifetime observers deliver inline and cannot be unsubscribed;
    /// use [`RecoilStore::subscribe`] for revocable ones.
    pub fn with_observers<I>(observers: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn StoreObserver>>,
    {
        let store = Self::new();
        for observer in observers {
            observer.on_attached(&store);
            store.inner.observers.write().push(ObserverEntry {
                id: SubscriptionId::new(),
                observer,
                executor: Arc::new(InlineExecutor),
            });
        }
        store
    }

    /// This store's identity, for diagnostics and binding checks.
    pub fn id(&self) -> StoreId {
        self.inner.id
    }

    /// Register a node under its key in this store.
    ///
    /// Registration is idempotent for the same instance and happens
    /// automatically on first use through any read or write path. A
    /// *different* live instance already holding the key is a
    /// [`RecoilError::KeyCollision`]; a dead one is silently replaced.
    pub fn register<N>(&self, node: &N) -> RecoilResult<()>
    where
        N: RecoilNode + ?Sized,
    {
        match self.inner.registry.entry(node.key().to_string()) {
            Entry::Occupied(mut entry) => {
                let registration = entry.get();
                if registration.id == node.id() {
                    return Ok(());
                }
                if registration.node.upgrade().is_none() {
                    entry.insert(NodeRegistration {
                        id: node.id(),
                        kind: node.kind(),
                        node: node.self_weak(),
                    });
                    tracing::trace!(
                        store = self.inner.id.raw(),
                        key = node.key(),
                        "dead registration reclaimed"
                    );
                    return Ok(());
                }
                Err(RecoilError::KeyCollision {
                    key: node.key().to_string(),
                    existing: registration.kind,
                    incoming: node.kind(),
                })
            }
            Entry::Vacant(entry) => {
                tracing::trace!(
                    store = self.inner.id.raw(),
                    key = node.key(),
                    kind = ?node.kind(),
                    "node registered"
                );
                entry.insert(NodeRegistration {
                    id: node.id(),
                    kind: node.kind(),
                    node: node.self_weak(),
                });
                Ok(())
            }
        }
    }

    /// Whether a value is currently stored under `key`.
    ///
    /// Atom defaults are not stored, so this reports `false` for an
    /// atom that has never been set even though it resolves fine.
    pub fn has_value(&self, key: &str) -> bool {
        self.inner.values.contains_key(key)
    }

    /// The stored value under `key` at its concrete type, if present.
    pub fn try_cached<T: StateValue>(&self, key: &str) -> Option<T> {
        self.peek(key)
    }

    /// The stored value under `key`, or [`RecoilError::NoValue`].
    ///
    /// Unlike [`RecoilStore::get_value`], this never falls back to a
    /// node default or evaluates a selector.
    pub fn cached_value<T: StateValue>(&self, key: &str) -> RecoilResult<T> {
        self.peek(key).ok_or_else(|| RecoilError::NoValue {
            key: key.to_string(),
        })
    }

    pub(crate) fn peek<T: StateValue>(&self, key: &str) -> Option<T> {
        self.inner
            .values
            .get(key)
            .and_then(|entry| entry.downcast::<T>())
    }

    /// Memoize a selector result under its key.
    pub(crate) fn cache_derived<T: StateValue>(&self, key: &str, value: &T) {
        self.inner
            .values
            .insert(key.to_string(), StoredValue::new(value.clone()));
    }

    /// Resolve a node's effective value in this store.
    pub async fn get_value<T, N>(&self, node: &N) -> RecoilResult<T>
    where
        T: StateValue,
        N: RecoilValue<T> + ?Sized,
    {
        node.get_value(self).await
    }

    /// Set an atom's value, reporting whether a change occurred.
    ///
    /// Writing a value equal to the stored one is a complete no-op:
    /// no effects run, nothing is evicted, nobody is notified.
    pub async fn set_value_async<T: StateValue>(
        &self,
        atom: &Atom<T>,
        value: T,
    ) -> RecoilResult<bool> {
        self.register(atom)?;
        let key = atom.key();

        let previous = self.peek::<T>(key);
        if previous.as_ref() == Some(&value) {
            tracing::trace!(
                store = self.inner.id.raw(),
                key,
                "set skipped, value unchanged"
            );
            return Ok(false);
        }

        // Effects observe the store in its pre-write state.
        atom.run_effects(Some(&value), previous.as_ref(), false);

        let raw = StoredValue::new(value);
        self.inner.values.insert(key.to_string(), raw.clone());
        tracing::debug!(store = self.inner.id.raw(), key, "value set");

        let Some(node) = atom.self_weak().upgrade() else {
            // The atom was dropped mid-call; nobody is left to notify.
            return Ok(true);
        };
        self.notify_changed(&node, Some(raw)).await;
        Ok(true)
    }

    /// Set an atom's value from a synchronous context.
    ///
    /// The write is spawned onto the current Tokio runtime; without one
    /// it is skipped with a warning. Use
    /// [`RecoilStore::set_value_async`] when you need the result.
    pub fn set_value<T: StateValue>(&self, atom: &Arc<Atom<T>>, value: T) {
        let store = self.clone();
        let atom = Arc::clone(atom);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = store.set_value_async(&atom, value).await {
                        tracing::warn!(key = atom.key(), %error, "background set failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    key = atom.key(),
                    "background set skipped, no async runtime"
                );
            }
        }
    }

    /// Remove an atom's stored value, reporting whether one was removed.
    ///
    /// Dependents are notified and re-resolve against the atom's
    /// default chain; resetting an atom that holds no value is a no-op.
    pub async fn reset_value_async<T: StateValue>(&self, atom: &Atom<T>) -> RecoilResult<bool> {
        self.register(atom)?;
        let key = atom.key();

        let Some((_, raw)) = self.inner.values.remove(key) else {
            return Ok(false);
        };
        let previous = raw.downcast::<T>();
        atom.run_effects(None, previous.as_ref(), true);
        tracing::debug!(store = self.inner.id.raw(), key, "value reset");

        let Some(node) = atom.self_weak().upgrade() else {
            return Ok(true);
        };
        self.notify_changed(&node, None).await;
        Ok(true)
    }

    /// Reset an atom from a synchronous context (spawned like
    /// [`RecoilStore::set_value`]).
    pub fn reset_value<T: StateValue>(&self, atom: &Arc<Atom<T>>) {
        let store = self.clone();
        let atom = Arc::clone(atom);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = store.reset_value_async(&atom).await {
                        tracing::warn!(key = atom.key(), %error, "background reset failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    key = atom.key(),
                    "background reset skipped, no async runtime"
                );
            }
        }
    }

    /// Run one notification cycle for a changed node.
    ///
    /// Order is fixed: evict memoized dependents, push to handles bound
    /// to the changed node, re-resolve handles bound to a transitive
    /// dependent, then tell observers. Each handle and observer hears
    /// about the change exactly once.
    async fn notify_changed(&self, node: &NodeRef, value: Option<StoredValue>) {
        let dependents = propagation::dependent_closure(node);
        self.evict_derived(&dependents);

        let bindings: Vec<Arc<dyn StateBinding>> = self.inner.bindings.read().clone();
        let changed_id = node.id();

        for binding in bindings.iter().filter(|b| b.node_id() == changed_id) {
            binding.pushed_value(self, value.as_ref()).await;
        }

        let dependent_ids: IndexSet<NodeId> = dependents.iter().map(|n| n.id()).collect();
        for binding in bindings
            .iter()
            .filter(|b| dependent_ids.contains(&b.node_id()))
        {
            binding.dependent_changed(self).await;
        }

        let observers: Vec<ObserverEntry> = self.inner.observers.read().clone();
        tracing::trace!(
            store = self.inner.id.raw(),
            key = node.key(),
            dependents = dependents.len(),
            observers = observers.len(),
            "change notified"
        );
        if observers.is_empty() {
            return;
        }

        let change = ValueChange {
            node: node.clone(),
            value,
            dependents: dependents.into(),
        };
        for entry in observers {
            let ObserverEntry {
                observer, executor, ..
            } = entry;
            let store = self.clone();
            let change = change.clone();
            executor.execute(Box::new(move || observer.on_value_changed(&store, &change)));
        }
    }

    /// Drop memoized selector results so they re-evaluate on next read.
    ///
    /// Atom entries in the closure are spared; an explicitly set atom
    /// keeps its value no matter what its default source does.
    fn evict_derived(&self, dependents: &[NodeRef]) {
        for node in dependents {
            if node.kind() == NodeKind::Selector && self.inner.values.remove(node.key()).is_some() {
                tracing::trace!(key = node.key(), "memoized selector value evicted");
            }
        }
    }

    /// Create a state handle bound to `node` and attach it here.
    pub fn use_state<T, N>(&self, node: &Arc<N>) -> RecoilResult<RecoilState<T>>
    where
        T: StateValue,
        N: RecoilValue<T> + 'static,
    {
        let state = RecoilState::detached(node);
        state.attach(self)?;
        Ok(state)
    }

    /// Attach an existing handle to this store, replacing whatever
    /// store it was attached to before.
    pub fn attach<T: StateValue>(&self, state: &RecoilState<T>) -> RecoilResult<()> {
        state.attach(self)
    }

    /// Detach a handle; equivalent to [`RecoilState::detach`].
    pub fn detach<T: StateValue>(&self, state: &RecoilState<T>) {
        state.detach();
    }

    pub(crate) fn attach_binding(&self, binding: Arc<dyn StateBinding>) -> RecoilResult<()> {
        let node = binding.node().clone();
        self.register(&*node)?;
        self.inner.bindings.write().push(binding);
        tracing::debug!(
            store = self.inner.id.raw(),
            key = node.key(),
            "state handle attached"
        );

        let observers: Vec<ObserverEntry> = self.inner.observers.read().clone();
        for entry in observers {
            entry.observer.on_handle_attached(self, &node);
        }
        Ok(())
    }

    pub(crate) fn detach_binding(&self, id: HandleId) {
        let removed = {
            let mut bindings = self.inner.bindings.write();
            bindings
                .iter()
                .position(|b| b.handle_id() == id)
                .map(|index| bindings.remove(index))
        };
        let Some(binding) = removed else { return };

        let node = binding.node().clone();
        tracing::debug!(
            store = self.inner.id.raw(),
            key = node.key(),
            "state handle detached"
        );
        let observers: Vec<ObserverEntry> = self.inner.observers.read().clone();
        for entry in observers {
            entry.observer.on_handle_detached(self, &node);
        }
    }

    /// Subscribe an observer with inline delivery.
    pub fn subscribe(&self, observer: Arc<dyn StoreObserver>) -> Subscription {
        self.subscribe_with(observer, Arc::new(InlineExecutor))
    }

    /// Subscribe an observer whose change callbacks run on `executor`.
    ///
    /// Lifecycle hooks always run inline; only value-change delivery is
    /// marshaled.
    pub fn subscribe_with(
        &self,
        observer: Arc<dyn StoreObserver>,
        executor: Arc<dyn NotifyExecutor>,
    ) -> Subscription {
        let id = SubscriptionId::new();
        observer.on_attached(self);
        self.inner.observers.write().push(ObserverEntry {
            id,
            observer,
            executor,
        });
        tracing::debug!(
            store = self.inner.id.raw(),
            subscription = id.raw(),
            "observer subscribed"
        );

        let store = self.clone();
        Subscription::new(move || {
            store.inner.observers.write().retain(|entry| entry.id != id);
            tracing::debug!(
                store = store.inner.id.raw(),
                subscription = id.raw(),
                "observer unsubscribed"
            );
        })
    }
}

impl fmt::Debug for RecoilStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoilStore")
            .field("id", &self.inner.id.raw())
            .field("values", &self.inner.values.len())
            .field("nodes", &self.inner.registry.len())
            .field("handles", &self.inner.bindings.read().len())
            .field("observers", &self.inner.observers.read().len())
            .finish()
    }
}
