//! File-backed configuration layer.

use super::ConfigSource;
use crate::error::{ConfigError, Result};
use config::File;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const SUPPORTED_EXTENSIONS: &[&str] = &["yaml", "yml", "toml", "json"];

/// A YAML, TOML or JSON file. The format follows the extension.
///
/// Required files fail the load when missing. Optional files (for example an
/// environment-specific overlay) contribute nothing when absent.
///
/// ```rust,no_run
/// use hotswap_registry::sources::FileSource;
///
/// let base = FileSource::new("config/base.yaml");
/// let overlay = FileSource::new("config/prod/config.yaml").optional().with_priority(110);
/// ```
pub struct FileSource {
    path: PathBuf,
    priority: i32,
    required: bool,
}

impl FileSource {
    /// A required file layer at the default priority (100).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            priority: 100,
            required: true,
        }
    }

    /// Set the merge priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Treat a missing file as an empty layer.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    fn check_extension(&self) -> Result<()> {
        let extension = self
            .path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| {
                ConfigError::LoadError(format!(
                    "No file extension to infer the format of {}",
                    self.path.display()
                ))
            })?;

        if SUPPORTED_EXTENSIONS.contains(&extension) {
            Ok(())
        } else {
            Err(ConfigError::LoadError(format!(
                "Unsupported file extension '{}' (expected one of {:?})",
                extension, SUPPORTED_EXTENSIONS
            )))
        }
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<HashMap<String, config::Value>> {
        self.check_extension()?;

        if !self.path.exists() {
            if self.required {
                return Err(ConfigError::LoadError(format!(
                    "Configuration file not found: {}",
                    self.path.display()
                )));
            }
            tracing::debug!(path = %self.path.display(), "optional config file absent");
            return Ok(HashMap::new());
        }

        config::Config::builder()
            .add_source(File::from(self.path.clone()).required(self.required))
            .build()
            .map_err(|e| ConfigError::LoadError(format!("{}: {}", self.path.display(), e)))?
            .try_deserialize::<HashMap<String, config::Value>>()
            .map_err(|e| ConfigError::DeserializationError(format!("{}: {}", self.path.display(), e)))
    }

    fn name(&self) -> String {
        format!("file:{}", self.path.display())
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
    fn test_extensions() {
        for name in ["a.yaml", "a.yml", "a.toml", "a.json"] {
            assert!(FileSource::new(name).check_extension().is_ok(), "{name}");
        }
        assert!(FileSource::new("a.ini").check_extension().is_err());
        assert!(FileSource::new("config").check_extension().is_err());
    }

    #[test]
    fn test_load_yaml_layer() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        fs::write(&path, "server:\n  addr: \":9090\"\n").unwrap();

        let map = FileSource::new(&path).load().unwrap();
        assert!(map.contains_key("server"));
    }

    #[test]
    fn test_missing_required_file() {
        assert!(FileSource::new("/nonexistent/config.yaml").load().is_err());
    }

    #[test]
    fn test_missing_optional_file_is_empty() {
        let map = FileSource::new("/nonexistent/config.yaml")
            .optional()
            .load()
            .unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_watch_path_and_name() {
        let source = FileSource::new("config/test/config.yaml").with_priority(110);
        assert_eq!(source.priority(), 110);
        assert_eq!(
            source.watch_path(),
            Some(Path::new("config/test/config.yaml"))
        );
        assert!(source.name().starts_with("file:"));
    }
}
