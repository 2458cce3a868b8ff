//! `.env` file overrides.

use super::ConfigSource;
use crate::error::{ConfigError, Result};
use config::Environment;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

/// Overrides read from a `.env` file, re-read on every load.
///
/// Keys follow the same scheme as [`EnvSource`](super::EnvSource):
/// `APP__STORAGE__DSN=...` with prefix `APP` and separator `__` sets
/// `storage.dsn`. The layer sits at priority 310, above the process
/// environment, which only holds the copy of this file taken at startup.
/// A missing file is an empty layer.
pub struct DotenvSource {
    path: PathBuf,
    prefix: String,
    separator: String,
    priority: i32,
}

impl DotenvSource {
    /// `.env` layer at `path` at priority 310.
    pub fn new(
        path: impl Into<PathBuf>,
        prefix: impl Into<String>,
        separator: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into(),
            separator: separator.into(),
            priority: 310,
        }
    }

    /// Set the merge priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn read_vars(&self) -> Result<HashMap<String, String>> {
        let iter = match dotenvy::from_path_iter(&self.path) {
            Ok(iter) => iter,
            Err(dotenvy::Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), ".env file absent");
                return Ok(HashMap::new());
            }
            Err(e) => return Err(self.error(e)),
        };

        let mut vars = HashMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| self.error(e))?;
            vars.insert(key, value);
        }
        Ok(vars)
    }

    fn error(&self, e: dotenvy::Error) -> ConfigError {
        match e {
            dotenvy::Error::Io(e) => ConfigError::IoError(e),
            other => ConfigError::LoadError(format!("{}: {}", self.name(), other)),
        }
    }
}

impl ConfigSource for DotenvSource {
    fn load(&self) -> Result<HashMap<String, config::Value>> {
        let vars = self.read_vars()?;
        let source = Environment::with_prefix(&self.prefix)
            .prefix_separator(&self.separator)
            .separator(&self.separator)
            .try_parsing(true)
            .source(Some(vars));

        config::Config::builder()
            .add_source(source)
            .build()
            .map_err(|e| ConfigError::LoadError(format!("{}: {}", self.name(), e)))?
            .try_deserialize::<HashMap<String, config::Value>>()
            .map_err(|e| ConfigError::DeserializationError(format!("{}: {}", self.name(), e)))
    }

    fn name(&self) -> String {
        format!("dotenv:{}", self.path.display())
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn watch_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_only_prefixed_keys_are_loaded() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".env");
        fs::write(
            &path,
            "MYSQL_USER=todo\nAPP__STORAGE__DSN=\"mysql://todo@db/todolist\"\n",
        )
        .unwrap();

        let map = DotenvSource::new(&path, "APP", "__").load().unwrap();
        assert_eq!(map.len(), 1);
        let storage = map["storage"].clone().into_table().unwrap();
        assert_eq!(
            storage["dsn"].clone().into_string().unwrap(),
            "mysql://todo@db/todolist"
        );
    }

    #[test]
    fn test_missing_file_is_empty() {
        let map = DotenvSource::new("/nonexistent/.env", "APP", "__")
            .load()
            .unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_directory_is_an_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = DotenvSource::new(temp_dir.path(), "APP", "__").load();
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_defaults() {
        let source = DotenvSource::new(".env", "APP", "__");
        assert_eq!(source.priority(), 310);
        assert_eq!(source.watch_path(), Some(Path::new(".env")));
        assert_eq!(source.name(), "dotenv:.env");
    }
}
