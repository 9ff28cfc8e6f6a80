//! Configuration validation support.

use crate::error::ValidationError;

/// Trait for configuration validation.
///
/// Types implementing `Validate` can be loaded with
/// [`LiveConfigBuilder::build_validated`](crate::core::LiveConfigBuilder::build_validated);
/// every later reload is validated the same way and rejected (keeping the old
/// snapshot) when it fails.
///
/// # Examples
///
/// ```rust
/// use config_change_subscriber::core::Validate;
/// use config_change_subscriber::error::ValidationError;
/// use serde::Deserialize;
///
/// #[derive(Debug, Deserialize, Clone)]
/// struct CacheSettings {
///     ttl_seconds: u64,
/// }
///
/// impl Validate for CacheSettings {
///     fn validate(&self) -> Result<(), ValidationError> {
///         if self.ttl_seconds == 0 {
///             return Err(ValidationError::invalid_field("ttl_seconds", "must be greater than 0"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Validate {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Should return a `ValidationError` describing what validation failed.
    fn validate(&self) -> Result<(), ValidationError>;
}
