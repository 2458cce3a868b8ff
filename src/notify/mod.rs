//! Configuration change notification.
//!
//! [`Observer`]s registered on a [`ConfigStore`](crate::core::ConfigStore) are
//! called once per changed facet on every reload. With the `file-watch`
//! feature, [`ConfigWatcher`] turns file modifications into reloads.

pub mod observer;
#[cfg(feature = "file-watch")]
pub mod watcher;

pub use observer::{Observer, ObserverList};
#[cfg(feature = "file-watch")]
pub use watcher::ConfigWatcher;
