//! Environment variable configuration source.

use super::ConfigSource;
use crate::error::{Result, SubscriberError};
use async_trait::async_trait;
use config::Environment;
use std::collections::HashMap;

/// Environment variable configuration source.
///
/// `APP_CHANGE_SUBSCRIPTION__SERVICE_BUS_TOPIC=changes` with prefix `APP` and
/// separator `__` sets `change_subscription.service_bus_topic`.
///
/// # Examples
///
/// ```rust
/// use config_change_subscriber::sources::EnvSource;
///
/// let source = EnvSource::new("APP", "__");
/// ```
pub struct EnvSource {
    prefix: String,
    separator: String,
    priority: i32,
}

impl EnvSource {
    /// Create a new environment variable source.
    pub fn new(prefix: impl Into<String>, separator: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            separator: separator.into(),
            priority: 300,
        }
    }

    /// Set the priority for this source.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl ConfigSource for EnvSource {
    async fn load(&self) -> Result<HashMap<String, config::Value>> {
        let env_source = Environment::with_prefix(&self.prefix)
            .prefix_separator("_")
            .separator(&self.separator)
            .try_parsing(true);

        let loaded = config::Config::builder()
            .add_source(env_source)
            .build()
            .map_err(|e| {
                SubscriberError::LoadError(format!("Failed to load environment variables: {}", e))
            })?;

        loaded
            .try_deserialize::<HashMap<String, config::Value>>()
            .map_err(|e| {
                SubscriberError::DeserializationError(format!(
                    "Failed to parse environment variables: {}",
                    e
                ))
            })
    }

    fn name(&self) -> String {
        format!("env:{}*", self.prefix)
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_source_creation() {
        let source = EnvSource::new("APP", "__");
        assert_eq!(source.prefix, "APP");
        assert_eq!(source.separator, "__");
        assert_eq!(source.priority(), 300);
        assert_eq!(source.name(), "env:APP*");
    }

    #[tokio::test]
    async fn test_load_without_matching_vars() {
        let source = EnvSource::new("CCS_TEST_NOTHING_SET_HERE", "__");
        let map = source.load().await.unwrap();
        assert!(map.is_empty());
    }
}
