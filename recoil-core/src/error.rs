//! Error types for the Recoil state store.
//!
//! Every fallible operation in the crate returns [`RecoilResult`]. Selector
//! getters are the one place application code can fail; those errors cross
//! the boundary as boxed trait objects and come back out wrapped in
//! [`RecoilError::Evaluation`] with the originating node's key attached.

use std::error::Error;

use thiserror::Error;

use crate::node::NodeKind;

/// Boxed application error produced inside a selector getter.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type RecoilResult<T> = Result<T, RecoilError>;

/// Errors that can occur when constructing nodes or resolving state.
#[derive(Debug, Error)]
pub enum RecoilError {
    /// A node was constructed with an unusable argument (e.g. a blank key).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Two distinct node instances were registered under the same key in
    /// one store. Keys must be unique per store; the same instance may be
    /// used freely across stores.
    #[error("key '{key}' already registered by another {existing:?} node (incoming {incoming:?})")]
    KeyCollision {
        key: String,
        existing: NodeKind,
        incoming: NodeKind,
    },

    /// A write was attempted against a read-only node.
    #[error("node '{key}' is not mutable")]
    NotMutable { key: String },

    /// A cached-value query found no stored entry for the key.
    ///
    /// Only raised by the explicit cache accessors; effective-value
    /// resolution falls back to the node's default instead.
    #[error("no value stored for key '{key}'")]
    NoValue { key: String },

    /// A node was re-entered during its own evaluation, either through a
    /// selector read chain or an atom default chain.
    #[error("circular dependency detected at '{key}'")]
    CircularDependency { key: String },

    /// A selector getter returned an error.
    #[error("evaluation of '{key}' failed: {source}")]
    Evaluation {
        key: String,
        #[source]
        source: BoxError,
    },
}

impl RecoilError {
    /// Wrap an application error escaping the getter of the named node.
    pub fn evaluation(key: impl Into<String>, source: BoxError) -> Self {
        RecoilError::Evaluation {
            key: key.into(),
            source,
        }
    }

    /// The key of the node the error concerns, when there is one.
    pub fn key(&self) -> Option<&str> {
        match self {
            RecoilError::InvalidArgument(_) => None,
            RecoilError::KeyCollision { key, .. }
            | RecoilError::NotMutable { key }
            | RecoilError::NoValue { key }
            | RecoilError::CircularDependency { key }
            | RecoilError::Evaluation { key, .. } => Some(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_preserves_source() {
        let inner: BoxError = "index out of range".into();
        let err = RecoilError::evaluation("selected_task", inner);

        assert_eq!(err.key(), Some("selected_task"));
        let source = err.source().expect("source should be attached");
        assert_eq!(source.to_string(), "index out of range");
    }

    #[test]
    fn display_includes_key() {
        let err = RecoilError::NotMutable {
            key: "full_name".to_string(),
        };
        assert!(err.to_string().contains("full_name"));

        let err = RecoilError::NoValue {
            key: "count".to_string(),
        };
        assert!(err.to_string().contains("count"));
    }

    #[test]
    fn collision_names_both_kinds() {
        let err = RecoilError::KeyCollision {
            key: "shared".to_string(),
            existing: NodeKind::Atom,
            incoming: NodeKind::Selector,
        };
        let msg = err.to_string();
        assert!(msg.contains("Atom"));
        assert!(msg.contains("Selector"));
    }
}
