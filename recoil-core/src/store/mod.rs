//! Store Layer
//!
//! This module implements the containers state actually lives in. Nodes
//! from [`crate::node`] are pure definitions; everything stateful about
//! them belongs to a store.
//!
//! # Concepts
//!
//! ## Stores
//!
//! A [`RecoilStore`] maps node keys to stored values and owns the write
//! path: setting an atom stores the value, evicts stale memoized
//! selector results, and notifies everything downstream in a fixed
//! order. Two stores never share values, so the same atom definition
//! can be `0` in one store and `42` in another.
//!
//! ## State Handles
//!
//! A [`RecoilState`] is a live view of one node in one store: latest
//! value, load status, change callbacks, and a watch channel. Writes
//! through a handle are optimistic; the local value updates immediately
//! and settles once the store write completes.
//!
//! ## Observers
//!
//! A [`StoreObserver`] hears about every effective value change in a
//! store, after all handles have been brought up to date, through a
//! pluggable [`NotifyExecutor`].
//!
//! # Implementation Notes
//!
//! Notification for one change is strictly ordered: memoized dependents
//! are evicted, handles bound to the changed node get the value pushed,
//! handles bound to a transitive dependent re-resolve, and observers go
//! last. The dependent closure is computed once per change by a
//! breadth-first walk, so each handle and observer hears about a change
//! exactly once even through diamond-shaped graphs.

mod observer;
mod propagation;
mod store;
mod handle;

pub use observer::{
    InlineExecutor, NotifyExecutor, StoreObserver, Subscription, SubscriptionId, TaskExecutor,
    ValueChange,
};
pub use store::{RecoilStore, StoreId, StoredValue};
pub use handle::{HandleId, HandleSnapshot, HandleStatus, RecoilState};
