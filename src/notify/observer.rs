//! Observers of configuration changes.

use crate::core::ChangeKind;
use parking_lot::RwLock;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Receives configuration change notifications.
///
/// Called synchronously on the reload path, in registration order, once per
/// changed facet. Implementations must return quickly; long work (such as a
/// socket rebind) belongs on a spawned task.
///
/// Closures taking `(&Arc<T>, ChangeKind)` implement this trait.
pub trait Observer<T>: Send + Sync {
    /// Handle a change of `kind`; `snapshot` is the new current snapshot.
    fn on_config_change(&self, snapshot: &Arc<T>, kind: ChangeKind);
}

impl<T, F> Observer<T> for F
where
    F: Fn(&Arc<T>, ChangeKind) + Send + Sync,
{
    fn on_config_change(&self, snapshot: &Arc<T>, kind: ChangeKind) {
        self(snapshot, kind)
    }
}

/// Ordered list of observers.
///
/// Registration takes the write lock. Dispatch copies the list under the read
/// lock and calls observers without holding it, so an observer may register
/// further observers and registration may race with dispatch.
pub struct ObserverList<T> {
    observers: RwLock<Vec<Arc<dyn Observer<T>>>>,
}

impl<T> ObserverList<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Append an observer.
    pub fn add(&self, observer: Arc<dyn Observer<T>>) {
        self.observers.write().push(observer);
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver every kind in `kinds` to every observer.
    ///
    /// A panicking observer is logged and skipped; the rest still run.
    pub fn notify(&self, snapshot: &Arc<T>, kinds: &[ChangeKind]) {
        if kinds.is_empty() {
            return;
        }
        let observers = self.observers.read().clone();

        for &kind in kinds {
            for (index, observer) in observers.iter().enumerate() {
                let delivered =
                    catch_unwind(AssertUnwindSafe(|| observer.on_config_change(snapshot, kind)));
                if delivered.is_err() {
                    tracing::error!(observer = index, %kind, "config observer panicked");
                }
            }
        }
    }
}

impl<T> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}
