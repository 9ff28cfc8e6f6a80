//! Configuration loader that merges multiple sources.

use crate::error::{Result, SubscriberError};
use crate::sources::ConfigSource;
use serde::de::DeserializeOwned;

/// Loads and merges configuration from multiple sources.
///
/// Sources are merged lowest priority first, so higher priority sources
/// override individual keys of lower priority ones.
pub struct ConfigLoader {
    sources: Vec<Box<dyn ConfigSource>>,
}

impl ConfigLoader {
    /// Create a new configuration loader.
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// Add a configuration source.
    pub fn add_source(&mut self, source: Box<dyn ConfigSource>) {
        self.sources.push(source);
    }

    /// Load every source and deserialize the merged result.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No sources were added
    /// - Any source fails to load
    /// - Deserialization fails
    pub async fn load<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        if self.sources.is_empty() {
            return Err(SubscriberError::LoadError(
                "No configuration sources specified".to_string(),
            ));
        }

        let mut builder = config::Config::builder();

        for source in self.sorted() {
            let values = source.load().await.map_err(|e| {
                SubscriberError::LoadError(format!("Failed to load source '{}': {}", source.name(), e))
            })?;
            tracing::trace!(source = %source.name(), keys = values.len(), "loaded configuration source");

            let mut leaves = Vec::new();
            for (key, value) in values {
                flatten(key, value, &mut leaves);
            }

            for (key, value) in leaves {
                builder = builder.set_override(&key, value).map_err(|e| {
                    SubscriberError::LoadError(format!(
                        "Failed to merge source '{}': {}",
                        source.name(),
                        e
                    ))
                })?;
            }
        }

        let merged = builder.build().map_err(|e| {
            SubscriberError::LoadError(format!("Failed to build configuration: {}", e))
        })?;

        merged.try_deserialize::<T>().map_err(|e| {
            SubscriberError::DeserializationError(format!(
                "Failed to deserialize configuration: {}",
                e
            ))
        })
    }

    /// Source names in merge order.
    pub fn source_names(&self) -> Vec<String> {
        self.sorted().iter().map(|s| s.name()).collect()
    }

    fn sorted(&self) -> Vec<&dyn ConfigSource> {
        let mut sorted: Vec<&dyn ConfigSource> = self.sources.iter().map(|s| s.as_ref()).collect();
        sorted.sort_by_key(|s| s.priority());
        sorted
    }
}

/// Split nested tables into dotted leaf keys so overrides merge per key
/// instead of replacing whole sections.
fn flatten(path: String, value: config::Value, out: &mut Vec<(String, config::Value)>) {
    match value.kind {
        config::ValueKind::Table(table) if !table.is_empty() => {
            for (key, child) in table {
                flatten(format!("{}.{}", path, key), child, out);
            }
        }
        kind => out.push((path, config::Value::new(None, kind))),
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
