//! Atom Effects
//!
//! An atom effect observes every effective write to one atom. Effects run
//! synchronously inside the store's set path, before the new value is
//! cached, so they see the store in its pre-write state.

use crate::node::StateValue;

/// Observer hook attached to an atom at construction.
pub trait AtomEffect<T: StateValue>: Send + Sync {
    /// Called on every effective set and reset of the atom.
    ///
    /// `new` is `None` on reset. `old` is `None` when the atom had no
    /// stored value yet. Equal-value writes never reach effects.
    fn on_set(&self, new: Option<&T>, old: Option<&T>, is_reset: bool);
}

/// Effect that logs every transition of an atom's value.
#[derive(Debug, Clone)]
pub struct LogChangesEffect {
    label: String,
}

impl LogChangesEffect {
    /// Create a logging effect. `label` names the atom in log output.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl<T: StateValue> AtomEffect<T> for LogChangesEffect {
    fn on_set(&self, new: Option<&T>, old: Option<&T>, is_reset: bool) {
        if is_reset {
            tracing::debug!(atom = %self.label, old = ?old, "atom reset");
        } else {
            tracing::debug!(atom = %self.label, old = ?old, new = ?new, "atom changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Recording {
        seen: Arc<Mutex<Vec<(Option<i32>, Option<i32>, bool)>>>,
    }

    impl AtomEffect<i32> for Recording {
        fn on_set(&self, new: Option<&i32>, old: Option<&i32>, is_reset: bool) {
            self.seen.lock().push((new.copied(), old.copied(), is_reset));
        }
    }

    #[test]
    fn effect_receives_transitions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let effect = Recording { seen: seen.clone() };

        effect.on_set(Some(&1), None, false);
        effect.on_set(Some(&2), Some(&1), false);
        effect.on_set(None, Some(&2), true);

        let log = seen.lock();
        assert_eq!(
            *log,
            vec![
                (Some(1), None, false),
                (Some(2), Some(1), false),
                (None, Some(2), true),
            ]
        );
    }

    #[test]
    fn log_effect_is_usable_for_any_value_type() {
        let effect = LogChangesEffect::new("names");
        AtomEffect::<String>::on_set(&effect, Some(&"Jane".to_string()), None, false);
        AtomEffect::<i32>::on_set(&LogChangesEffect::new("count"), None, Some(&3), true);
    }
}
