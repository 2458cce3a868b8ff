//! Configuration source trait.

use crate::error::Result;
use std::collections::HashMap;

/// A layer of configuration values.
///
/// The loader merges every source's flattened key/value map in ascending
/// [`priority`](ConfigSource::priority) order, so a source with a higher
/// priority overrides the keys it sets and leaves the rest untouched.
pub trait ConfigSource: Send + Sync {
    /// Read the layer as a map of top-level keys to values.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer exists but cannot be read or parsed.
    fn load(&self) -> Result<HashMap<String, config::Value>>;

    /// Label used in log lines and load errors.
    fn name(&self) -> String;

    /// Merge priority. Files start at 100, environment overrides sit at 300.
    fn priority(&self) -> i32 {
        100
    }

    /// Filesystem path backing this layer, if any. Used to set up watches.
    fn watch_path(&self) -> Option<&std::path::Path> {
        None
    }
}
