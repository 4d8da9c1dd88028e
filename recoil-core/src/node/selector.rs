//! Selector Implementation
//!
//! A Selector is a derived value: an async getter that reads other nodes
//! through a [`ValueProvider`] and computes a result. Dependencies are
//! discovered at evaluation time from what the getter actually reads,
//! so conditional reads produce exactly the edges of the branch taken.
//!
//! # How Evaluation Works
//!
//! 1. A cached result under the selector's key is returned as is. The
//!    store evicts that entry whenever a transitive source changes, so a
//!    hit is always as fresh as the last change.
//!
//! 2. On a miss the getter runs with a fresh provider. On success the
//!    recorded read set replaces the selector's source edges and the
//!    result is cached under the selector's key.
//!
//! 3. On failure nothing is committed: no cache entry, and the edges
//!    keep reflecting the last successful evaluation.
//!
//! # Writability
//!
//! Selectors are read-only unless constructed with a setter. A setter
//! receives the store and the incoming value and performs its own atom
//! writes; each of those re-enters the normal set protocol, so a
//! multi-atom setter is not transactional.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{BoxError, RecoilError, RecoilResult};
use crate::node::provider::{ReadSet, ValueProvider};
use crate::node::value::{
    EvalPath, NodeBase, NodeId, NodeKind, RecoilNode, RecoilValue, StateValue, WeakNode,
};
use crate::store::RecoilStore;

type GetterFn<T> = dyn Fn(ValueProvider) -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync;
type SetterFn<T> = dyn Fn(RecoilStore, T) -> BoxFuture<'static, RecoilResult<()>> + Send + Sync;

/// A derived state node computed from other nodes.
///
/// # Example
///
/// ```rust,ignore
/// let first = Atom::with_default("first_name", "John".to_string())?;
/// let last = Atom::with_default("last_name", "Smith".to_string())?;
///
/// let full = Selector::new("full_name", {
///     let (first, last) = (first.clone(), last.clone());
///     move |provider: ValueProvider| {
///         let (first, last) = (first.clone(), last.clone());
///         async move {
///             Ok(format!("{} {}", provider.get(&*first).await?, provider.get(&*last).await?))
///         }
///     }
/// })?;
/// ```
pub struct Selector<T: StateValue> {
    base: NodeBase,
    getter: Box<GetterFn<T>>,
    setter: Option<Box<SetterFn<T>>>,
}

impl<T: StateValue> Selector<T> {
    /// Create a read-only selector from an async getter.
    pub fn new<G, Fut>(key: impl Into<String>, getter: G) -> RecoilResult<Arc<Self>>
    where
        G: Fn(ValueProvider) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let getter: Box<GetterFn<T>> = Box::new(move |provider| Box::pin(getter(provider)));
        Self::build(key.into(), getter, None)
    }

    /// Create a writable selector from an async getter and setter.
    pub fn writable<G, GFut, S, SFut>(
        key: impl Into<String>,
        getter: G,
        setter: S,
    ) -> RecoilResult<Arc<Self>>
    where
        G: Fn(ValueProvider) -> GFut + Send + Sync + 'static,
        GFut: Future<Output = Result<T, BoxError>> + Send + 'static,
        S: Fn(RecoilStore, T) -> SFut + Send + Sync + 'static,
        SFut: Future<Output = RecoilResult<()>> + Send + 'static,
    {
        let getter: Box<GetterFn<T>> = Box::new(move |provider| Box::pin(getter(provider)));
        let setter: Box<SetterFn<T>> = Box::new(move |store, value| Box::pin(setter(store, value)));
        Self::build(key.into(), getter, Some(setter))
    }

    fn build(
        key: String,
        getter: Box<GetterFn<T>>,
        setter: Option<Box<SetterFn<T>>>,
    ) -> RecoilResult<Arc<Self>> {
        NodeBase::validate_key(&key)?;
        let mutable = setter.is_some();
        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_weak: WeakNode = weak.clone();
            Self {
                base: NodeBase::new(key, NodeKind::Selector, mutable, self_weak),
                getter,
                setter,
            }
        }))
    }
}

impl<T: StateValue> RecoilNode for Selector<T> {
    fn id(&self) -> NodeId {
        self.base.id()
    }

    fn key(&self) -> &str {
        self.base.key()
    }

    fn kind(&self) -> NodeKind {
        self.base.kind()
    }

    fn is_mutable(&self) -> bool {
        self.base.is_mutable()
    }

    fn self_weak(&self) -> WeakNode {
        self.base.self_weak()
    }

    fn add_dependent(&self, id: NodeId, node: WeakNode) {
        self.base.add_dependent(id, node);
    }

    fn remove_dependent(&self, id: NodeId) {
        self.base.remove_dependent(id);
    }

    fn dependents(&self) -> Vec<crate::node::NodeRef> {
        self.base.dependents()
    }
}

impl<T: StateValue> RecoilValue<T> for Selector<T> {
    fn resolve<'a>(
        &'a self,
        store: &'a RecoilStore,
        path: EvalPath,
    ) -> BoxFuture<'a, RecoilResult<T>> {
        Box::pin(async move {
            let path = path.enter(self.base.id(), self.base.key())?;
            store.register(self)?;

            if let Some(cached) = store.peek::<T>(self.base.key()) {
                tracing::trace!(key = self.base.key(), "selector cache hit");
                return Ok(cached);
            }

            let reads: ReadSet = Arc::new(Mutex::new(IndexMap::new()));
            let provider = ValueProvider::new(
                store.clone(),
                self.base.id(),
                self.base.self_weak(),
                path,
                reads.clone(),
            );

            match (self.getter)(provider).await {
                Ok(value) => {
                    let committed = std::mem::take(&mut *reads.lock());
                    self.base.replace_sources(committed);
                    store.cache_derived(self.base.key(), &value);
                    tracing::trace!(key = self.base.key(), "selector evaluated");
                    Ok(value)
                }
                Err(source) => {
                    tracing::debug!(
                        key = self.base.key(),
                        error = %source,
                        "selector evaluation failed"
                    );
                    Err(RecoilError::evaluation(self.base.key(), source))
                }
            }
        })
    }

    fn set_value<'a>(
        &'a self,
        store: &'a RecoilStore,
        value: T,
    ) -> BoxFuture<'a, RecoilResult<()>> {
        Box::pin(async move {
            match &self.setter {
                Some(setter) => {
                    store.register(self)?;
                    setter(store.clone(), value).await
                }
                None => Err(RecoilError::NotMutable {
                    key: self.base.key().to_string(),
                }),
            }
        })
    }
}

impl<T: StateValue> fmt::Debug for Selector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("id", &self.base.id().raw())
            .field("key", &self.base.key())
            .field("writable", &self.base.is_mutable())
            .field("sources", &self.base.source_ids().len())
            .field("dependents", &self.base.dependent_count())
            .finish()
    }
}
