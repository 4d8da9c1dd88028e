//! Atom Implementation
//!
//! An Atom is a mutable root value. It owns no computation; its effective
//! value is whatever the store has cached for its key, falling back to a
//! default when nothing has been set yet.
//!
//! # How Defaults Work
//!
//! The default is resolved lazily on read and is never cached under the
//! atom's key. A constant default is cloned out on demand. A linked
//! default delegates to another node (an atom or a selector), and the
//! atom registers itself as a dependent of that node so a change to the
//! source propagates through the atom to its own dependents.
//!
//! Once a value has been set, the default is out of the picture until a
//! reset removes the stored entry again.

use std::fmt;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;

use crate::error::RecoilResult;
use crate::node::effect::AtomEffect;
use crate::node::value::{
    EvalPath, NodeBase, NodeId, NodeKind, RecoilNode, RecoilValue, StateValue, WeakNode,
};
use crate::store::RecoilStore;

/// Where an atom's value comes from when the store has none.
enum DefaultSource<T: StateValue> {
    /// A fixed fallback value.
    Constant(T),
    /// Another node resolved on demand.
    Linked(Arc<dyn RecoilValue<T>>),
}

impl<T: StateValue> fmt::Debug for DefaultSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultSource::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            DefaultSource::Linked(source) => f.debug_tuple("Linked").field(&source.key()).finish(),
        }
    }
}

/// A mutable state cell identified by a key.
///
/// Constructed behind an `Arc` so dependency edges and state handles can
/// hold weak references to it.
///
/// # Example
///
/// ```rust,ignore
/// let store = RecoilStore::new();
/// let count = Atom::with_default("count", 0)?;
///
/// assert_eq!(count.get_value(&store).await?, 0);
/// store.set_value_async(&count, 5).await?;
/// assert_eq!(count.get_value(&store).await?, 5);
/// ```
pub struct Atom<T: StateValue> {
    base: NodeBase,
    default: DefaultSource<T>,
    effects: Vec<Arc<dyn AtomEffect<T>>>,
}

impl<T: StateValue> Atom<T> {
    /// Create an atom whose default is `T::default()`.
    pub fn new(key: impl Into<String>) -> RecoilResult<Arc<Self>>
    where
        T: Default,
    {
        Self::with_default(key, T::default())
    }

    /// Create an atom with a constant default value.
    pub fn with_default(key: impl Into<String>, value: T) -> RecoilResult<Arc<Self>> {
        Self::build(key, DefaultSource::Constant(value), Vec::new())
    }

    /// Create an atom with a constant default and attached effects.
    pub fn with_effects(
        key: impl Into<String>,
        value: T,
        effects: Vec<Arc<dyn AtomEffect<T>>>,
    ) -> RecoilResult<Arc<Self>> {
        Self::build(key, DefaultSource::Constant(value), effects)
    }

    /// Create an atom whose default is resolved from another node.
    pub fn with_default_source<N>(
        key: impl Into<String>,
        source: &Arc<N>,
    ) -> RecoilResult<Arc<Self>>
    where
        N: RecoilValue<T> + 'static,
    {
        Self::with_default_source_and_effects(key, source, Vec::new())
    }

    /// Create an atom with a linked default and attached effects.
    pub fn with_default_source_and_effects<N>(
        key: impl Into<String>,
        source: &Arc<N>,
        effects: Vec<Arc<dyn AtomEffect<T>>>,
    ) -> RecoilResult<Arc<Self>>
    where
        N: RecoilValue<T> + 'static,
    {
        let linked: Arc<dyn RecoilValue<T>> = source.clone();
        let atom = Self::build(key, DefaultSource::Linked(linked), effects)?;

        // A change to the source must reach this atom's dependents, so the
        // atom itself becomes a dependent of the source.
        source.add_dependent(atom.base.id(), atom.base.self_weak());
        atom.base.record_source(source.id(), source.self_weak());
        Ok(atom)
    }

    fn build(
        key: impl Into<String>,
        default: DefaultSource<T>,
        effects: Vec<Arc<dyn AtomEffect<T>>>,
    ) -> RecoilResult<Arc<Self>> {
        let key = key.into();
        NodeBase::validate_key(&key)?;
        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_weak: WeakNode = weak.clone();
            Self {
                base: NodeBase::new(key, NodeKind::Atom, true, self_weak),
                default,
                effects,
            }
        }))
    }

    /// Run the attached effects for an effective write.
    pub(crate) fn run_effects(&self, new: Option<&T>, old: Option<&T>, is_reset: bool) {
        for effect in &self.effects {
            effect.on_set(new, old, is_reset);
        }
    }
}

impl<T: StateValue> RecoilNode for Atom<T> {
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

impl<T: StateValue> RecoilValue<T> for Atom<T> {
    fn resolve<'a>(
        &'a self,
        store: &'a RecoilStore,
        path: EvalPath,
    ) -> BoxFuture<'a, RecoilResult<T>> {
        Box::pin(async move {
            let path = path.enter(self.base.id(), self.base.key())?;
            store.register(self)?;

            if let Some(value) = store.peek::<T>(self.base.key()) {
                return Ok(value);
            }

            // No stored value; fall back to the default without caching it.
            match &self.default {
                DefaultSource::Constant(value) => Ok(value.clone()),
                DefaultSource::Linked(source) => source.resolve(store, path).await,
            }
        })
    }

    fn set_value<'a>(
        &'a self,
        store: &'a RecoilStore,
        value: T,
    ) -> BoxFuture<'a, RecoilResult<()>> {
        Box::pin(async move { store.set_value_async(self, value).await.map(|_| ()) })
    }
}

impl<T: StateValue> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.base.id().raw())
            .field("key", &self.base.key())
            .field("default", &self.default)
            .field("dependents", &self.base.dependent_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecoilError;
    use crate::node::{Selector, ValueProvider};
    use std::sync::OnceLock;

    #[test]
    fn blank_key_is_rejected() {
        let result = Atom::<i32>::with_default(" ", 1);
        assert!(matches!(result, Err(RecoilError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn default_resolves_without_caching() {
        let store = RecoilStore::new();
        let count = Atom::with_default("count", 41).expect("atom");

        assert_eq!(count.get_value(&store).await.expect("get"), 41);
        // The default was returned, not stored.
        assert!(!store.has_value("count"));
    }

    #[tokio::test]
    async fn explicit_value_overrides_default() {
        let store = RecoilStore::new();
        let count = Atom::with_default("count", 0).expect("atom");

        store.set_value_async(&count, 7).await.expect("set");
        assert_eq!(count.get_value(&store).await.expect("get"), 7);
        assert!(store.has_value("count"));
    }

    #[tokio::test]
    async fn derived_default_type_uses_std_default() {
        let store = RecoilStore::new();
        let name = Atom::<String>::new("name").expect("atom");
        assert_eq!(name.get_value(&store).await.expect("get"), String::new());
    }

    #[tokio::test]
    async fn linked_default_wires_dependency_edge() {
        let base = Atom::with_default("base", 10).expect("base");
        let mirror = Atom::with_default_source("mirror", &base).expect("mirror");

        let dependents = base.dependents();
        assert!(dependents.iter().any(|node| node.id() == mirror.id()));
        assert_eq!(mirror.base.source_ids(), vec![base.id()]);
    }

    #[tokio::test]
    async fn linked_default_follows_source_until_set() {
        let store = RecoilStore::new();
        let base = Atom::with_default("base", 10).expect("base");
        let mirror = Atom::with_default_source("mirror", &base).expect("mirror");

        assert_eq!(mirror.get_value(&store).await.expect("get"), 10);

        store.set_value_async(&base, 20).await.expect("set base");
        assert_eq!(mirror.get_value(&store).await.expect("get"), 20);

        // An explicit value disconnects the read from the source.
        store.set_value_async(&mirror, 99).await.expect("set mirror");
        assert_eq!(mirror.get_value(&store).await.expect("get"), 99);

        store.set_value_async(&base, 30).await.expect("set base");
        assert_eq!(mirror.get_value(&store).await.expect("get"), 99);
    }

    #[tokio::test]
    async fn default_cycle_fails_instead_of_recursing() {
        let store = RecoilStore::new();
        let slot: Arc<OnceLock<Arc<Atom<i32>>>> = Arc::new(OnceLock::new());

        let seed = Selector::new("cycle_seed", {
            let slot = slot.clone();
            move |provider: ValueProvider| {
                let slot = slot.clone();
                async move {
                    let atom = slot.get().cloned().ok_or("atom not wired")?;
                    Ok(provider.get(&*atom).await? + 1)
                }
            }
        })
        .expect("selector");

        let looped = Atom::with_default_source("looped", &seed).expect("atom");
        assert!(slot.set(looped.clone()).is_ok());

        let err = looped.get_value(&store).await.expect_err("cycle must fail");
        assert!(err.to_string().contains("circular dependency"));
    }

    #[test]
    fn atoms_are_mutable_and_report_kind() {
        let count = Atom::with_default("count", 0).expect("atom");
        assert!(count.is_mutable());
        assert_eq!(count.kind(), NodeKind::Atom);
        assert_eq!(count.key(), "count");
    }

    #[test]
    fn self_weak_upgrades_to_the_same_instance() {
        let count = Atom::with_default("count", 0).expect("atom");
        let upgraded = count.self_weak().upgrade().expect("node alive");
        assert_eq!(upgraded.id(), count.id());
    }
}
