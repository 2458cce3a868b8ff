//! The configuration store: current snapshot plus change dispatch.

use crate::core::{ChangeKind, ConfigLoader, Facets, Validate};
use crate::error::{ConfigError, Result, ValidationError};
use crate::notify::{Observer, ObserverList};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::Arc;

#[cfg(feature = "file-watch")]
use crate::notify::ConfigWatcher;

/// Type alias for validator closures.
pub(crate) type Validator<T> =
    Arc<dyn Fn(&T) -> std::result::Result<(), ValidationError> + Send + Sync>;

/// Holds the current configuration snapshot and notifies observers when it
/// changes.
///
/// Snapshots are immutable and replaced wholesale. Reads go through
/// `arc-swap` and never block. Observers are registered on the store, not on
/// a snapshot, so they survive every reload. Cloning the store is cheap and
/// every clone shares the same snapshot and observer list.
///
/// ```rust
/// use hotswap_registry::prelude::*;
/// use std::sync::Arc;
///
/// let store = ConfigStore::new(ServiceConfig::new(":9090", "127.0.0.1:2379"));
/// store.add_observer(Arc::new(|cfg: &Arc<ServiceConfig>, kind: ChangeKind| {
///     println!("{kind} changed, server now on {}", cfg.server.addr);
/// }));
///
/// let next = store.current().with_server_addr(":9091");
/// let changed = store.update(next).unwrap();
/// assert_eq!(changed, vec![ChangeKind::Server]);
/// ```
pub struct ConfigStore<T> {
    inner: Arc<StoreInner<T>>,
}

pub(crate) struct StoreInner<T> {
    current: ArcSwap<T>,
    loader: Option<ConfigLoader>,
    validator: Option<Validator<T>>,
    observers: ObserverList<T>,
    /// Serializes swap + diff + dispatch so each diff sees its predecessor.
    apply: Mutex<()>,
    #[cfg(feature = "file-watch")]
    watcher: Option<ConfigWatcher>,
}

impl<T> ConfigStore<T>
where
    T: Facets + Validate + Send + Sync + 'static,
{
    /// Create a store around an initial snapshot, without sources.
    ///
    /// Such a store changes only through [`update`](Self::update).
    pub fn new(initial: T) -> Self {
        Self::from_parts(initial, None, None)
    }

    pub(crate) fn from_parts(
        initial: T,
        loader: Option<ConfigLoader>,
        validator: Option<Validator<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                current: ArcSwap::from_pointee(initial),
                loader,
                validator,
                observers: ObserverList::new(),
                apply: Mutex::new(()),
                #[cfg(feature = "file-watch")]
                watcher: None,
            }),
        }
    }

    #[cfg(feature = "file-watch")]
    pub(crate) fn from_parts_watched(
        initial: T,
        loader: ConfigLoader,
        validator: Option<Validator<T>>,
        watcher: ConfigWatcher,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                current: ArcSwap::from_pointee(initial),
                loader: Some(loader),
                validator,
                observers: ObserverList::new(),
                apply: Mutex::new(()),
                watcher: Some(watcher),
            }),
        }
    }

    /// The most recently committed snapshot.
    pub fn current(&self) -> Arc<T> {
        self.inner.current.load_full()
    }

    /// Register an observer. Notification order is registration order.
    pub fn add_observer(&self, observer: Arc<dyn Observer<T>>) {
        self.inner.observers.add(observer);
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    /// Whether a file watcher feeds this store.
    pub fn is_watching(&self) -> bool {
        #[cfg(feature = "file-watch")]
        {
            self.inner.watcher.is_some()
        }
        #[cfg(not(feature = "file-watch"))]
        {
            false
        }
    }

    /// Re-read every source and apply the result.
    ///
    /// Returns the facets that changed (empty when nothing did). On error the
    /// previous snapshot stays current and no observer is called.
    ///
    /// # Errors
    ///
    /// Fails if the store has no sources, a source cannot be read, or the new
    /// snapshot does not deserialize or validate.
    pub fn reload(&self) -> Result<Vec<ChangeKind>>
    where
        T: DeserializeOwned,
    {
        let loader = self.inner.loader.as_ref().ok_or(ConfigError::NoSources)?;
        let next: T = loader.load()?;
        self.apply(next)
    }

    /// Apply a snapshot directly, through the same validate, swap and notify
    /// path as a reload.
    ///
    /// # Errors
    ///
    /// Fails if the snapshot does not validate; the previous one is kept.
    pub fn update(&self, next: T) -> Result<Vec<ChangeKind>> {
        self.apply(next)
    }

    fn apply(&self, next: T) -> Result<Vec<ChangeKind>> {
        next.validate()?;
        if let Some(validator) = &self.inner.validator {
            validator(&next)?;
        }

        let _guard = self.inner.apply.lock();
        let next = Arc::new(next);
        let previous = self.inner.current.swap(Arc::clone(&next));
        let kinds = previous.changes(&next);

        if kinds.is_empty() {
            tracing::debug!("config reloaded without observable changes");
        } else {
            tracing::info!(changes = ?kinds, observers = self.inner.observers.len(), "config changed");
            self.inner.observers.notify(&next, &kinds);
        }
        Ok(kinds)
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<StoreInner<T>> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &std::sync::Weak<StoreInner<T>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }
}

impl<T> Clone for ConfigStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct Pair {
        addr: String,
        dsn: String,
    }

    impl Facets for Pair {
        fn changes(&self, next: &Self) -> Vec<ChangeKind> {
            let mut kinds = Vec::new();
            if self.addr != next.addr {
                kinds.push(ChangeKind::Server);
            }
            if self.dsn != next.dsn {
                kinds.push(ChangeKind::Storage);
            }
            kinds
        }
    }

    impl Validate for Pair {
        fn validate(&self) -> std::result::Result<(), ValidationError> {
            if self.addr.is_empty() {
                return Err(ValidationError::invalid_field("addr", "empty"));
            }
            Ok(())
        }
    }

    fn pair(addr: &str, dsn: &str) -> Pair {
        Pair {
            addr: addr.into(),
            dsn: dsn.into(),
        }
    }

    fn counting(store: &ConfigStore<Pair>) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        store.add_observer(Arc::new(move |_: &Arc<Pair>, _: ChangeKind| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        calls
    }

    #[test]
    fn test_current_returns_latest() {
        let store = ConfigStore::new(pair(":9090", "a"));
        store.update(pair(":9091", "a")).unwrap();
        assert_eq!(store.current().addr, ":9091");
    }

    #[test]
    fn test_unchanged_update_is_silent() {
        let store = ConfigStore::new(pair(":9090", "a"));
        let calls = counting(&store);

        let kinds = store.update(pair(":9090", "a")).unwrap();
        assert!(kinds.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_one_call_per_changed_facet() {
        let store = ConfigStore::new(pair(":9090", "a"));
        let calls = counting(&store);

        store.update(pair(":9091", "b")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalid_update_keeps_previous() {
        let store = ConfigStore::new(pair(":9090", "a"));
        let calls = counting(&store);

        assert!(store.update(pair("", "a")).is_err());
        assert_eq!(store.current().addr, ":9090");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reload_without_sources() {
        #[derive(Debug, Clone, serde::Deserialize)]
        struct Empty {}
        impl Facets for Empty {
            fn changes(&self, _: &Self) -> Vec<ChangeKind> {
                Vec::new()
            }
        }
        impl Validate for Empty {}

        let store = ConfigStore::new(Empty {});
        assert!(matches!(store.reload(), Err(ConfigError::NoSources)));
    }

    #[test]
    fn test_clones_share_observers_and_snapshot() {
        let store = ConfigStore::new(pair(":9090", "a"));
        let clone = store.clone();
        let calls = counting(&clone);

        store.update(pair(":9091", "a")).unwrap();
        assert_eq!(clone.current().addr, ":9091");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.observer_count(), 1);
    }
}
