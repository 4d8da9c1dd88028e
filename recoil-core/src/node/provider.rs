//! Value Provider
//!
//! A `ValueProvider` is the accessor a selector getter receives for one
//! evaluation. Reading other nodes through it does two things at once:
//!
//! 1. The reader is registered as a dependent of the target immediately,
//!    before the target's value is resolved. A change that lands while
//!    the evaluation is still in flight therefore already sees the edge.
//!
//! 2. The read is recorded in the evaluation's read set. When the getter
//!    finishes successfully, the selector commits that read set as its
//!    new source set, replacing the previous one; edges to sources that
//!    were not read this time are removed. A failed evaluation commits
//!    nothing, so the edges continue to reflect the last successful run.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::RecoilResult;
use crate::node::value::{EvalPath, NodeId, RecoilValue, StateValue, WeakNode};
use crate::store::RecoilStore;

/// Reads recorded during one evaluation, shared between the provider and
/// the selector that committed to it.
pub(crate) type ReadSet = Arc<Mutex<IndexMap<NodeId, WeakNode>>>;

/// Per-evaluation accessor passed to selector getters.
pub struct ValueProvider {
    store: RecoilStore,
    reader_id: NodeId,
    reader: WeakNode,
    path: EvalPath,
    reads: ReadSet,
}

impl ValueProvider {
    pub(crate) fn new(
        store: RecoilStore,
        reader_id: NodeId,
        reader: WeakNode,
        path: EvalPath,
        reads: ReadSet,
    ) -> Self {
        Self {
            store,
            reader_id,
            reader,
            path,
            reads,
        }
    }

    /// The store this evaluation runs against.
    pub fn store(&self) -> &RecoilStore {
        &self.store
    }

    /// Read another node's value, recording the dependency.
    ///
    /// The edge is registered before the target resolves; re-entering a
    /// node already on the evaluation chain fails with
    /// [`CircularDependency`](crate::RecoilError::CircularDependency).
    pub async fn get<T, N>(&self, node: &N) -> RecoilResult<T>
    where
        T: StateValue,
        N: RecoilValue<T> + ?Sized,
    {
        node.add_dependent(self.reader_id, self.reader.clone());
        self.reads.lock().insert(node.id(), node.self_weak());
        node.resolve(&self.store, self.path.clone()).await
    }
}

impl fmt::Debug for ValueProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueProvider")
            .field("reader", &self.reader_id.raw())
            .field("depth", &self.path.len())
            .field("reads", &self.reads.lock().len())
            .finish()
    }
}
