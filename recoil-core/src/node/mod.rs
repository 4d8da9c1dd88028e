//! State Nodes
//!
//! This module implements the two node types of the dependency graph and
//! the protocol that connects them.
//!
//! # Concepts
//!
//! ## Atoms
//!
//! An Atom is a mutable root value identified by a key. Its effective
//! value is the store's cached entry for that key, or a lazily resolved
//! default (a constant, or another node linked at construction).
//!
//! ## Selectors
//!
//! A Selector derives a value from other nodes with an async getter. The
//! nodes it reads are discovered at evaluation time through a
//! [`ValueProvider`], and each successful evaluation replaces the
//! selector's dependency edges with what it actually read.
//!
//! ## Identity
//!
//! Nodes are identified by instance, not by key: a key is a per-store
//! lookup name, and registering two distinct instances under one key in
//! the same store is a collision. Edges between nodes hold weak
//! references, so dropping a node never keeps its neighbors alive.

mod atom;
mod effect;
mod provider;
mod selector;
mod value;

pub use atom::Atom;
pub use effect::{AtomEffect, LogChangesEffect};
pub use provider::ValueProvider;
pub use selector::Selector;
pub use value::{EvalPath, NodeId, NodeKind, NodeRef, RecoilNode, RecoilValue, StateValue, WeakNode};
