//! Merges layered sources into one typed snapshot.

use crate::error::{ConfigError, Result};
use crate::sources::ConfigSource;
use serde::de::DeserializeOwned;
use std::path::PathBuf;

/// Ordered set of configuration layers.
///
/// Layers are merged lowest priority first. Equal priorities keep insertion
/// order, so a later file of the same priority still wins.
#[derive(Default)]
pub struct ConfigLoader {
    sources: Vec<Box<dyn ConfigSource>>,
}

impl ConfigLoader {
    /// Create an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer.
    pub fn add_source(&mut self, source: Box<dyn ConfigSource>) {
        self.sources.push(source);
    }

    /// Whether any layer has been added.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Paths of file-backed layers, for the watcher.
    pub fn watch_paths(&self) -> Vec<PathBuf> {
        self.sources
            .iter()
            .filter_map(|s| s.watch_path().map(|p| p.to_path_buf()))
            .collect()
    }

    /// Merge every layer and deserialize the result.
    ///
    /// # Errors
    ///
    /// Fails when there are no layers, a layer cannot be read, or the merged
    /// values do not deserialize into `T`.
    pub fn load<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }

        let mut ordered: Vec<_> = self.sources.iter().collect();
        ordered.sort_by_key(|s| s.priority());

        let mut builder = config::Config::builder();
        for source in ordered {
            let values = source.load()?;
            tracing::trace!(source = %source.name(), keys = values.len(), "merging config layer");

            for (key, value) in values {
                builder = builder.set_override(&key, value).map_err(|e| {
                    ConfigError::LoadError(format!("{}: cannot merge '{}': {}", source.name(), key, e))
                })?;
            }
        }

        builder
            .build()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?
            .try_deserialize::<T>()
            .map_err(|e| ConfigError::DeserializationError(e.to_string()))
    }
}
