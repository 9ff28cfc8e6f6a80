//! Builder for constructing LiveConfig instances.

use crate::core::live_config::Validator;
use crate::core::{ConfigLoader, LiveConfig};
use crate::error::{Result, SubscriberError, ValidationError};
use crate::sources::{ConfigSource, EnvSource, FileSource};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::Arc;

#[cfg(feature = "validation")]
use crate::core::Validate;

/// Type-erased validator stored until the target type is known.
type AnyValidator =
    Arc<dyn Fn(&dyn std::any::Any) -> std::result::Result<(), ValidationError> + Send + Sync>;

/// Builder for a [`LiveConfig`].
///
/// Sources merge in this order (later wins): files in the order added,
/// custom sources by their own priority, environment overrides.
///
/// # Examples
///
/// ```rust,no_run
/// use config_change_subscriber::prelude::*;
///
/// # async fn example() -> Result<()> {
/// let settings = LiveConfig::builder()
///     .with_file("config/subscriber.yaml")
///     .with_optional_file("config/subscriber.local.yaml")
///     .with_env_overrides("CHANGE_SUBSCRIPTION", "__")
///     .build_validated::<ChangeSubscriptionSettings>()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct LiveConfigBuilder {
    files: Vec<(PathBuf, bool)>,
    env_prefix: Option<String>,
    env_separator: Option<String>,
    custom_sources: Vec<Box<dyn ConfigSource>>,
    validator: Option<AnyValidator>,
}

impl LiveConfigBuilder {
    /// Create a new builder with no sources.
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            env_prefix: None,
            env_separator: None,
            custom_sources: Vec::new(),
            validator: None,
        }
    }

    /// Add a required file (YAML, TOML or JSON by extension).
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push((path.into(), true));
        self
    }

    /// Add a file that is skipped when it does not exist.
    pub fn with_optional_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push((path.into(), false));
        self
    }

    /// Add environment variable overrides (`{prefix}_{a}{separator}{b}` -> `a.b`).
    pub fn with_env_overrides(mut self, prefix: &str, separator: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self.env_separator = Some(separator.to_string());
        self
    }

    /// Add a custom configuration source.
    pub fn with_source<S: ConfigSource + 'static>(mut self, source: S) -> Self {
        self.custom_sources.push(Box::new(source));
        self
    }

    /// Add a validation function applied on build and on every reload.
    pub fn with_validation<F, T>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> std::result::Result<(), ValidationError> + Send + Sync + 'static,
        T: 'static,
    {
        self.validator = Some(Arc::new(move |value: &dyn std::any::Any| {
            let typed = value
                .downcast_ref::<T>()
                .ok_or_else(|| ValidationError::custom("Type mismatch in validator"))?;
            validator(typed)
        }));
        self
    }

    /// Load every source and build the handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial load, deserialization or validation fails.
    pub async fn build<T>(self) -> Result<LiveConfig<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let mut loader = ConfigLoader::new();

        for (index, (path, required)) in self.files.iter().enumerate() {
            let priority = 100 + (index as i32 * 10);
            let mut source = FileSource::new(path).with_priority(priority);
            if !required {
                source = source.optional();
            }
            loader.add_source(Box::new(source));
        }

        for source in self.custom_sources {
            loader.add_source(source);
        }

        if let (Some(prefix), Some(separator)) = (self.env_prefix, self.env_separator) {
            loader.add_source(Box::new(EnvSource::new(prefix, separator)));
        }

        tracing::debug!(sources = ?loader.source_names(), "loading configuration");
        let initial: T = loader.load().await?;

        let validator: Option<Validator<T>> = self.validator.map(|any| {
            Arc::new(move |value: &T| any(value as &dyn std::any::Any)) as Validator<T>
        });

        if let Some(validator) = &validator {
            validator(&initial).map_err(|e| SubscriberError::ValidationError(e.to_string()))?;
        }

        Ok(LiveConfig::with_loader(initial, loader, validator))
    }

    /// Build a handle for a type implementing [`Validate`], validating on
    /// build and on every reload.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial load, deserialization or validation fails.
    #[cfg(feature = "validation")]
    pub async fn build_validated<T>(self) -> Result<LiveConfig<T>>
    where
        T: DeserializeOwned + Validate + Send + Sync + 'static,
    {
        self.with_validation(|value: &T| value.validate())
            .build::<T>()
            .await
    }
}

impl Default for LiveConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveConfig<()> {
    /// Create a new builder for constructing a configuration handle.
    pub fn builder() -> LiveConfigBuilder {
        LiveConfigBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Debug, Deserialize, Clone, PartialEq)]
    struct DemoSettings {
        greeting: String,
        retries: u32,
    }

    #[test]
    fn test_builder_accumulates_files() {
        let builder = LiveConfigBuilder::new()
            .with_file("a.yaml")
            .with_optional_file("b.yaml");
        assert_eq!(builder.files.len(), 2);
        assert!(builder.files[0].1);
        assert!(!builder.files[1].1);
    }

    #[test]
    fn test_builder_env_overrides() {
        let builder = LiveConfigBuilder::new().with_env_overrides("APP", "__");
        assert_eq!(builder.env_prefix.as_deref(), Some("APP"));
        assert_eq!(builder.env_separator.as_deref(), Some("__"));
    }

    #[tokio::test]
    async fn test_later_file_overrides_earlier() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.yaml");
        let overlay = dir.path().join("overlay.yaml");
        fs::write(&base, "greeting: hello\nretries: 3\n").unwrap();
        fs::write(&overlay, "retries: 5\n").unwrap();

        let config = LiveConfig::builder()
            .with_file(&base)
            .with_file(&overlay)
            .with_optional_file(dir.path().join("missing.yaml"))
            .build::<DemoSettings>()
            .await
            .unwrap();

        assert_eq!(config.get().greeting, "hello");
        assert_eq!(config.get().retries, 5);
    }

    #[tokio::test]
    async fn test_validation_failure_on_build() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("demo.yaml");
        fs::write(&path, "greeting: ''\nretries: 3\n").unwrap();

        let result = LiveConfig::builder()
            .with_file(&path)
            .with_validation(|s: &DemoSettings| {
                if s.greeting.is_empty() {
                    return Err(ValidationError::invalid_field("greeting", "must not be empty"));
                }
                Ok(())
            })
            .build::<DemoSettings>()
            .await;

        assert!(matches!(result, Err(SubscriberError::ValidationError(_))));
    }
}
