//! Node Identity and the Value Protocol
//!
//! This module defines the shared identity of every state node and the
//! async resolution protocol that atoms and selectors implement.
//!
//! # How Identity Works
//!
//! 1. Every node gets a process-unique [`NodeId`] at construction. Two
//!    nodes are the same node only if their ids are equal; the key is a
//!    per-store lookup name, not an identity.
//!
//! 2. A key therefore may be reused across stores by the same instance,
//!    while two distinct instances sharing a key inside one store is a
//!    collision and fails fast.
//!
//! # How Edges Work
//!
//! Nodes form a dependency graph. Each node records the nodes that read
//! from it (`dependents`) and the nodes it read during its last committed
//! evaluation (`sources`). Both sides hold weak references so that
//! dropping a node never leaks its neighbors; dead edges are pruned the
//! next time they are walked.
//!
//! Dependent registration is idempotent: re-adding an existing edge is a
//! no-op, so re-evaluation never duplicates notifications.
//!
//! # Cycle Detection
//!
//! Resolution threads an [`EvalPath`] through nested evaluations. The
//! path is the chain of nodes currently being resolved; re-entering a
//! node already on the chain is a circular dependency and fails instead
//! of recursing forever. The path is cloned per branch, so sibling reads
//! of the same node do not conflict.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::error::{RecoilError, RecoilResult};
use crate::store::RecoilStore;

/// Unique identifier for a state node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// The kind of state node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A mutable root value. Atoms hold state and have no sources of
    /// their own (a linked default is a fallback, not a computation).
    Atom,

    /// A derived value. Selectors compute from other nodes and cache
    /// their result in the store under their own key.
    Selector,
}

/// Bounds required of every value held in state.
///
/// `Clone` because values are handed out by value, `PartialEq` because
/// writing an equal value must be detectable as a no-op, and `Debug` so
/// changes can be logged. Blanket-implemented; never implement by hand.
pub trait StateValue: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

impl<T> StateValue for T where T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

/// Shared reference to a node, erased to its identity surface.
pub type NodeRef = Arc<dyn RecoilNode>;

/// Weak reference to a node. Edges and registries hold these.
pub type WeakNode = Weak<dyn RecoilNode>;

/// Identity and edge surface shared by atoms and selectors.
///
/// Object safe; dependency edges and store registries operate on
/// `dyn RecoilNode` without knowing the value type.
pub trait RecoilNode: fmt::Debug + Send + Sync {
    /// The node's process-unique ID.
    fn id(&self) -> NodeId;

    /// The node's key, used for store lookup.
    fn key(&self) -> &str;

    /// Whether this node is an atom or a selector.
    fn kind(&self) -> NodeKind;

    /// Whether writes are accepted.
    fn is_mutable(&self) -> bool;

    /// Weak handle to this node as a trait object.
    fn self_weak(&self) -> WeakNode;

    /// Record that `node` reads from this node. Idempotent.
    fn add_dependent(&self, id: NodeId, node: WeakNode);

    /// Remove a dependent edge, if present.
    fn remove_dependent(&self, id: NodeId);

    /// Snapshot the live dependents, pruning edges whose nodes have been
    /// dropped.
    fn dependents(&self) -> Vec<NodeRef>;
}

/// Typed resolution surface implemented by [`Atom`](crate::node::Atom)
/// and [`Selector`](crate::node::Selector).
///
/// Resolution is async because selector getters are async. The methods
/// return boxed futures so the trait stays object safe and handles can
/// bind `Arc<dyn RecoilValue<T>>`.
pub trait RecoilValue<T: StateValue>: RecoilNode {
    /// Resolve the node's effective value through `store`.
    ///
    /// `path` is the chain of nodes already being evaluated; nested
    /// resolutions extend it and re-entry fails with
    /// [`RecoilError::CircularDependency`].
    fn resolve<'a>(
        &'a self,
        store: &'a RecoilStore,
        path: EvalPath,
    ) -> BoxFuture<'a, RecoilResult<T>>;

    /// Write a new value through `store`.
    ///
    /// Atoms accept writes unconditionally; selectors only when built
    /// with a setter, otherwise [`RecoilError::NotMutable`].
    fn set_value<'a>(
        &'a self,
        store: &'a RecoilStore,
        value: T,
    ) -> BoxFuture<'a, RecoilResult<()>>;

    /// Resolve the node's effective value from the top of an evaluation.
    fn get_value<'a>(&'a self, store: &'a RecoilStore) -> BoxFuture<'a, RecoilResult<T>> {
        self.resolve(store, EvalPath::new())
    }
}

/// The chain of nodes currently being evaluated.
///
/// Threaded by value through nested resolutions; each branch clones the
/// chain, so the path always reads root-to-leaf for the current branch
/// only. Chains are short in practice and stay on the stack.
#[derive(Debug, Clone, Default)]
pub struct EvalPath(SmallVec<[NodeId; 8]>);

impl EvalPath {
    /// An empty path, used at the top of an evaluation.
    pub fn new() -> Self {
        Self(SmallVec::new())
    }

    /// Whether `id` is already being evaluated on this chain.
    pub fn contains(&self, id: NodeId) -> bool {
        self.0.contains(&id)
    }

    /// Number of nodes on the chain.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Extend the chain with the node about to be evaluated.
    ///
    /// Fails with [`RecoilError::CircularDependency`] when the node is
    /// already on the chain.
    pub(crate) fn enter(&self, id: NodeId, key: &str) -> RecoilResult<EvalPath> {
        if self.contains(id) {
            return Err(RecoilError::CircularDependency {
                key: key.to_string(),
            });
        }
        let mut next = self.clone();
        next.0.push(id);
        Ok(next)
    }
}

/// State shared by every node implementation.
///
/// Holds the identity fields plus both edge maps. The maps are keyed by
/// [`NodeId`] and insertion ordered, which keeps notification order
/// deterministic.
#[derive(Debug)]
pub(crate) struct NodeBase {
    id: NodeId,
    key: String,
    kind: NodeKind,
    mutable: bool,
    /// Weak self-reference as a trait object, captured at construction.
    self_weak: WeakNode,
    /// Nodes that read this node during their last committed evaluation.
    dependents: RwLock<IndexMap<NodeId, WeakNode>>,
    /// Nodes this node read during its last committed evaluation.
    sources: RwLock<IndexMap<NodeId, WeakNode>>,
}

impl NodeBase {
    /// Check a key before construction. Keys must contain at least one
    /// non-whitespace character.
    pub(crate) fn validate_key(key: &str) -> RecoilResult<()> {
        if key.trim().is_empty() {
            return Err(RecoilError::InvalidArgument(format!(
                "node key must not be blank (got {key:?})"
            )));
        }
        Ok(())
    }

    pub(crate) fn new(key: String, kind: NodeKind, mutable: bool, self_weak: WeakNode) -> Self {
        Self {
            id: NodeId::new(),
            key,
            kind,
            mutable,
            self_weak,
            dependents: RwLock::new(IndexMap::new()),
            sources: RwLock::new(IndexMap::new()),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.kind
    }

    pub(crate) fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub(crate) fn self_weak(&self) -> WeakNode {
        self.self_weak.clone()
    }

    pub(crate) fn add_dependent(&self, id: NodeId, node: WeakNode) {
        self.dependents.write().entry(id).or_insert(node);
    }

    pub(crate) fn remove_dependent(&self, id: NodeId) {
        self.dependents.write().shift_remove(&id);
    }

    pub(crate) fn dependents(&self) -> Vec<NodeRef> {
        let mut guard = self.dependents.write();
        let mut live = Vec::with_capacity(guard.len());
        guard.retain(|_, weak| match weak.upgrade() {
            Some(node) => {
                live.push(node);
                true
            }
            None => false,
        });
        live
    }

    pub(crate) fn dependent_count(&self) -> usize {
        self.dependents.read().len()
    }

    /// Record a single static source edge (linked atom defaults).
    pub(crate) fn record_source(&self, id: NodeId, node: WeakNode) {
        self.sources.write().entry(id).or_insert(node);
    }

    /// Ids of the sources recorded by the last committed evaluation.
    pub(crate) fn source_ids(&self) -> Vec<NodeId> {
        self.sources.read().keys().copied().collect()
    }

    /// Replace the source set with the reads committed by a successful
    /// evaluation. Sources that were read last time but not this time
    /// lose their dependent edge back to this node.
    pub(crate) fn replace_sources(&self, reads: IndexMap<NodeId, WeakNode>) {
        let dropped: Vec<WeakNode> = {
            let mut sources = self.sources.write();
            let dropped = sources
                .iter()
                .filter(|(id, _)| !reads.contains_key(*id))
                .map(|(_, weak)| weak.clone())
                .collect();
            *sources = reads;
            dropped
        };
        // Detach on the source side outside our own lock.
        for weak in dropped {
            if let Some(source) = weak.upgrade() {
                source.remove_dependent(self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique() {
        let a = NodeId::new();
        let b = NodeId::new();
        let c = NodeId::new();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn blank_keys_are_rejected() {
        assert!(NodeBase::validate_key("count").is_ok());
        assert!(matches!(
            NodeBase::validate_key(""),
            Err(RecoilError::InvalidArgument(_))
        ));
        assert!(matches!(
            NodeBase::validate_key("   "),
            Err(RecoilError::InvalidArgument(_))
        ));
    }

    #[test]
    fn eval_path_detects_reentry() {
        let a = NodeId::new();
        let b = NodeId::new();

        let path = EvalPath::new();
        let path = path.enter(a, "a").expect("first entry");
        let path = path.enter(b, "b").expect("second entry");
        assert_eq!(path.len(), 2);

        let err = path.enter(a, "a").expect_err("re-entry must fail");
        assert!(matches!(err, RecoilError::CircularDependency { key } if key == "a"));
    }

    #[test]
    fn eval_path_branches_are_independent() {
        let a = NodeId::new();
        let b = NodeId::new();
        let c = NodeId::new();

        let root = EvalPath::new().enter(a, "a").expect("enter a");

        // Two sibling branches may both evaluate the same node.
        let left = root.enter(b, "b").expect("left branch");
        let right = root.enter(b, "b").expect("right branch");
        assert!(left.contains(b));
        assert!(right.contains(b));

        // The original chain is untouched by its branches.
        assert_eq!(root.len(), 1);
        assert!(!root.contains(c));
    }
}
