//! Recoil Core
//!
//! This crate provides the core runtime for the Recoil reactive state
//! store. It implements:
//!
//! - State definitions (atoms with lazy defaults, async derived selectors)
//! - Per-store value containers with key-based registration
//! - Transitive change propagation with memoization and eviction
//! - Consumer state handles with optimistic writes and load status
//! - Store observers with pluggable notification executors
//!
//! Definitions and storage are deliberately separate: an [`Atom`] or
//! [`Selector`] describes state, a [`RecoilStore`] holds its values,
//! and the same definition can live in any number of stores at once.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `node`: Atoms, selectors, and the dependency graph between them
//! - `store`: Value containers, state handles, observers, propagation
//! - `error`: The error type shared by every fallible operation
//!
//! # Example
//!
//! ```rust,ignore
//! use recoil_core::{Atom, RecoilStore, Selector, ValueProvider};
//!
//! // Define state
//! let count = Atom::with_default("count", 0)?;
//! let doubled = Selector::new("doubled", {
//!     let count = count.clone();
//!     move |provider: ValueProvider| {
//!         let count = count.clone();
//!         async move { Ok(provider.get(&*count).await? * 2) }
//!     }
//! })?;
//!
//! // Give it a place to live
//! let store = RecoilStore::new();
//! assert_eq!(doubled.get_value(&store).await?, 0);
//!
//! // Update the atom; the selector result follows
//! store.set_value_async(&count, 5).await?;
//! assert_eq!(doubled.get_value(&store).await?, 10);
//! ```

pub mod error;
pub mod node;
pub mod store;

pub use error::{BoxError, RecoilError, RecoilResult};
pub use node::{
    Atom, AtomEffect, LogChangesEffect, NodeId, NodeKind, NodeRef, RecoilNode, RecoilValue,
    Selector, StateValue, ValueProvider,
};
pub use store::{
    HandleId, HandleSnapshot, HandleStatus, InlineExecutor, NotifyExecutor, RecoilState,
    RecoilStore, StoreId, StoreObserver, StoredValue, Subscription, SubscriptionId, TaskExecutor,
    ValueChange,
};
