//! Builder for constructing a [`ConfigStore`] from layered sources.

use crate::core::config_store::Validator;
use crate::core::{ConfigLoader, ConfigStore, Facets, Validate};
use crate::error::{Result, ValidationError};
use crate::sources::{ConfigSource, DotenvSource, EnvSource, FileSource};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
#[cfg(feature = "file-watch")]
use std::time::Duration;

/// Builder for a [`ConfigStore`].
///
/// File layers get increasing priorities in the order they are added (100,
/// 110, …), custom sources keep their own, environment overrides sit at
/// 300 and `.env` overrides on top at 310.
///
/// ```rust,no_run
/// use hotswap_registry::prelude::*;
/// use std::time::Duration;
///
/// # async fn example() -> hotswap_registry::error::Result<()> {
/// let store: ConfigStore<ServiceConfig> = ConfigStore::builder()
///     .with_file("config/base.yaml")
///     .with_optional_file("config/prod/config.yaml")
///     .with_env_overrides("APP", "__")
///     .with_file_watch(Duration::from_millis(500))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ConfigStoreBuilder<T> {
    files: Vec<(PathBuf, bool)>,
    env: Option<(String, String)>,
    custom_sources: Vec<Box<dyn ConfigSource>>,
    validator: Option<Validator<T>>,
    #[cfg(feature = "file-watch")]
    watch_debounce: Option<Duration>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ConfigStoreBuilder<T>
where
    T: DeserializeOwned + Facets + Validate + Send + Sync + 'static,
{
    /// Create a builder with no sources.
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            env: None,
            custom_sources: Vec::new(),
            validator: None,
            #[cfg(feature = "file-watch")]
            watch_debounce: None,
            _marker: PhantomData,
        }
    }

    /// Add a required file layer. Later files override earlier ones.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push((path.into(), true));
        self
    }

    /// Add a file layer that is skipped when the file does not exist.
    pub fn with_optional_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push((path.into(), false));
        self
    }

    /// Add environment overrides, e.g. `APP__SERVER__ADDR` for prefix `APP`
    /// and separator `__`.
    pub fn with_env_overrides(mut self, prefix: &str, separator: &str) -> Self {
        self.env = Some((prefix.to_string(), separator.to_string()));
        self
    }

    /// Add overrides from a `.env` file, keyed like
    /// [`with_env_overrides`](Self::with_env_overrides) and layered above
    /// the process environment. The file is re-read on every reload and is
    /// watched along with the file layers.
    pub fn with_dotenv(mut self, path: impl Into<PathBuf>, prefix: &str, separator: &str) -> Self {
        self.custom_sources
            .push(Box::new(DotenvSource::new(path, prefix, separator)));
        self
    }

    /// Add a custom source.
    pub fn with_source<S: ConfigSource + 'static>(mut self, source: S) -> Self {
        self.custom_sources.push(Box::new(source));
        self
    }

    /// Add a check that runs after [`Validate`] on every candidate snapshot,
    /// including the initial one.
    pub fn with_validation<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> std::result::Result<(), ValidationError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Reload automatically when a file layer changes. Bursts of changes are
    /// collapsed into one reload after `debounce` of quiet.
    #[cfg(feature = "file-watch")]
    pub fn with_file_watch(mut self, debounce: Duration) -> Self {
        self.watch_debounce = Some(debounce);
        self
    }

    fn loader(&mut self) -> ConfigLoader {
        let mut loader = ConfigLoader::new();
        for (index, (path, required)) in self.files.drain(..).enumerate() {
            let mut source = FileSource::new(path).with_priority(100 + index as i32 * 10);
            if !required {
                source = source.optional();
            }
            loader.add_source(Box::new(source));
        }
        for source in self.custom_sources.drain(..) {
            loader.add_source(source);
        }
        if let Some((prefix, separator)) = self.env.take() {
            loader.add_source(Box::new(EnvSource::new(prefix, separator)));
        }
        loader
    }

    /// Load, validate and return the store.
    ///
    /// With file watching enabled this must run inside a tokio runtime: the
    /// reload loop is a spawned task holding a weak reference to the store,
    /// and it ends once every clone of the store is dropped.
    ///
    /// # Errors
    ///
    /// Fails if the initial load or validation fails, or the watcher cannot
    /// be set up.
    pub fn build(mut self) -> Result<ConfigStore<T>> {
        let loader = self.loader();
        let initial: T = loader.load()?;
        initial.validate()?;
        if let Some(validator) = &self.validator {
            validator(&initial)?;
        }

        #[cfg(feature = "file-watch")]
        if let Some(debounce) = self.watch_debounce {
            return watched(initial, loader, self.validator, debounce);
        }

        Ok(ConfigStore::from_parts(initial, Some(loader), self.validator))
    }
}

#[cfg(feature = "file-watch")]
fn watched<T>(
    initial: T,
    loader: ConfigLoader,
    validator: Option<Validator<T>>,
    debounce: Duration,
) -> Result<ConfigStore<T>>
where
    T: DeserializeOwned + Facets + Validate + Send + Sync + 'static,
{
    use crate::notify::ConfigWatcher;

    let (watcher, mut signals) = ConfigWatcher::new(debounce)?;
    for path in loader.watch_paths() {
        if let Err(e) = watcher.watch(&path) {
            tracing::warn!(path = %path.display(), error = %e, "config file will not be watched");
        }
    }

    let store = ConfigStore::from_parts_watched(initial, loader, validator, watcher);
    let weak = store.downgrade();
    tokio::spawn(async move {
        while signals.recv().await.is_some() {
            let Some(store) = ConfigStore::upgrade(&weak) else {
                break;
            };
            // Reload reads files; keep it off the async workers.
            match tokio::task::spawn_blocking(move || store.reload()).await {
                Ok(Ok(kinds)) if kinds.is_empty() => tracing::debug!("config file touched, nothing changed"),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "config reload rejected, keeping previous snapshot"),
                Err(e) => tracing::error!(error = %e, "config reload task failed"),
            }
        }
        tracing::debug!("config watch loop stopped");
    });

    Ok(store)
}

impl<T> Default for ConfigStoreBuilder<T>
where
    T: DeserializeOwned + Facets + Validate + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConfigStore<T>
where
    T: DeserializeOwned + Facets + Validate + Send + Sync + 'static,
{
    /// Create a builder for a store loaded from sources.
    pub fn builder() -> ConfigStoreBuilder<T> {
        ConfigStoreBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServiceConfig;
    use std::fs;
    use tempfile::TempDir;

    const BASE: &str = r#"
server:
  addr: ":9090"
coordination:
  addr: "127.0.0.1:2379"
"#;

    #[test]
    fn test_file_priorities_follow_insertion_order() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("base.yaml");
        let overlay = temp_dir.path().join("overlay.yaml");
        fs::write(&base, BASE).unwrap();
        fs::write(&overlay, "coordination:\n  addr: \"etcd:2379\"\n").unwrap();

        let store: ConfigStore<ServiceConfig> = ConfigStore::builder()
            .with_file(&base)
            .with_file(&overlay)
            .build()
            .unwrap();

        assert_eq!(store.current().coordination.addr, "etcd:2379");
        assert_eq!(store.current().server.addr, ":9090");
        assert!(!store.is_watching());
    }

    #[test]
    fn test_missing_optional_overlay() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("base.yaml");
        fs::write(&base, BASE).unwrap();

        let store: ConfigStore<ServiceConfig> = ConfigStore::builder()
            .with_file(&base)
            .with_optional_file(temp_dir.path().join("missing.yaml"))
            .build()
            .unwrap();
        assert_eq!(store.current().server.addr, ":9090");
    }

    #[test]
    fn test_initial_snapshot_is_validated() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("base.yaml");
        fs::write(&base, BASE).unwrap();

        let result: Result<ConfigStore<ServiceConfig>> = ConfigStore::builder()
            .with_file(&base)
            .with_validation(|cfg: &ServiceConfig| {
                if cfg.server.addr == ":9090" {
                    return Err(ValidationError::invalid_field("server.addr", "reserved"));
                }
                Ok(())
            })
            .build();
        assert!(result.is_err());
    }
}
