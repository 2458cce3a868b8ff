//! Snapshot validation.

use crate::error::ValidationError;

/// Checks run on every candidate snapshot before it becomes current.
///
/// A snapshot that fails validation is discarded and the previous one stays
/// in place.
///
/// ```rust
/// use hotswap_registry::core::Validate;
/// use hotswap_registry::error::ValidationError;
///
/// struct Limits {
///     max_connections: usize,
/// }
///
/// impl Validate for Limits {
///     fn validate(&self) -> Result<(), ValidationError> {
///         if self.max_connections == 0 {
///             return Err(ValidationError::invalid_field(
///                 "max_connections",
///                 "must be greater than 0",
///             ));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Validate {
    /// Validate the snapshot.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` describing what is wrong.
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}
