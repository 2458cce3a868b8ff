//! Environment variable overrides.

use super::ConfigSource;
use crate::error::{ConfigError, Result};
use config::Environment;
use std::collections::HashMap;

/// Environment override layer.
///
/// `APP__SERVER__ADDR=:9091` with prefix `APP` and separator `__` sets
/// `server.addr`. Values are parsed as numbers or booleans where possible.
pub struct EnvSource {
    prefix: String,
    separator: String,
    priority: i32,
}

impl EnvSource {
    /// Override layer at priority 300, above every file layer.
    pub fn new(prefix: impl Into<String>, separator: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            separator: separator.into(),
            priority: 300,
        }
    }

    /// Set the merge priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl ConfigSource for EnvSource {
    fn load(&self) -> Result<HashMap<String, config::Value>> {
        let source = Environment::with_prefix(&self.prefix)
            .prefix_separator(&self.separator)
            .separator(&self.separator)
            .try_parsing(true);

        config::Config::builder()
            .add_source(source)
            .build()
            .map_err(|e| ConfigError::LoadError(format!("{}: {}", self.name(), e)))?
            .try_deserialize::<HashMap<String, config::Value>>()
            .map_err(|e| ConfigError::DeserializationError(format!("{}: {}", self.name(), e)))
    }

    fn name(&self) -> String {
        format!("env:{}*", self.prefix)
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}
