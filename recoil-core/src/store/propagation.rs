//! Change Propagation
//!
//! When a node's stored value changes, everything that read it, and
//! everything that read *that*, has to hear about it. This module walks
//! the dependent edges breadth first and produces the transitive
//! closure of a changed node:
//!
//! 1. The changed node itself is excluded; callers notify it directly.
//! 2. Diamond-shaped graphs yield each dependent exactly once.
//! 3. Cycles terminate because a visited node is never re-queued.
//! 4. Dead edges (dropped dependents) are pruned as they are met.
//!
//! The result is insertion ordered: direct dependents first, then
//! theirs, which is the order notifications are delivered in.

use std::collections::VecDeque;

use indexmap::IndexSet;

use crate::node::{NodeId, NodeRef};

/// Collect every live transitive dependent of `root`, breadth first.
pub(crate) fn dependent_closure(root: &NodeRef) -> Vec<NodeRef> {
    let mut visited: IndexSet<NodeId> = IndexSet::new();
    visited.insert(root.id());

    let mut queue: VecDeque<NodeRef> = root.dependents().into();
    let mut closure = Vec::new();

    while let Some(node) = queue.pop_front() {
        if !visited.insert(node.id()) {
            continue;
        }
        queue.extend(node.dependents());
        closure.push(node);
    }

    closure
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Atom, RecoilNode};
    use std::sync::Arc;

    fn atom(key: &str) -> Arc<Atom<i32>> {
        Atom::with_default(key, 0).expect("atom")
    }

    fn link(source: &Arc<Atom<i32>>, dependent: &Arc<Atom<i32>>) {
        source.add_dependent(dependent.id(), dependent.self_weak());
    }

    #[test]
    fn diamond_yields_each_dependent_once() {
        let a = atom("diamond_a");
        let b = atom("diamond_b");
        let c = atom("diamond_c");
        let d = atom("diamond_d");
        link(&a, &b);
        link(&a, &c);
        link(&b, &d);
        link(&c, &d);

        let root: NodeRef = a.clone();
        let closure = dependent_closure(&root);

        let ids: Vec<NodeId> = closure.iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec![b.id(), c.id(), d.id()]);
    }

    #[test]
    fn cyclic_edges_terminate() {
        let a = atom("cycle_a");
        let b = atom("cycle_b");
        link(&a, &b);
        link(&b, &a);

        let root: NodeRef = a.clone();
        let closure = dependent_closure(&root);

        assert_eq!(closure.len(), 1);
        assert_eq!(closure[0].id(), b.id());
    }

    #[test]
    fn order_is_breadth_first() {
        let a = atom("bfs_a");
        let b = atom("bfs_b");
        let c = atom("bfs_c");
        let d = atom("bfs_d");
        link(&a, &b);
        link(&a, &c);
        link(&c, &d);

        let root: NodeRef = a.clone();
        let ids: Vec<NodeId> = dependent_closure(&root).iter().map(|n| n.id()).collect();

        assert_eq!(ids, vec![b.id(), c.id(), d.id()]);
    }

    #[test]
    fn dropped_dependents_disappear() {
        let a = atom("drop_a");
        {
            let b = atom("drop_b");
            link(&a, &b);
        }

        let root: NodeRef = a.clone();
        assert!(dependent_closure(&root).is_empty());
    }
}
