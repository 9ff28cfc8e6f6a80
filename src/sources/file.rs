//! File-based configuration source.

use super::ConfigSource;
use crate::error::{Result, SubscriberError};
use async_trait::async_trait;
use config::File;
use std::collections::HashMap;
use std::path::PathBuf;

/// File-based configuration source.
///
/// Loads YAML, TOML or JSON, detected from the file extension. A missing file
/// is an error unless the source is marked optional, in which case it
/// contributes nothing (local overrides that only exist on developer machines).
///
/// # Examples
///
/// ```rust,no_run
/// use config_change_subscriber::sources::FileSource;
///
/// let source = FileSource::new("config/appsettings.yaml");
/// let local = FileSource::new("config/appsettings.local.yaml").optional();
/// ```
pub struct FileSource {
    path: PathBuf,
    priority: i32,
    required: bool,
}

impl FileSource {
    /// Create a required file source.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            priority: 100,
            required: true,
        }
    }

    /// Set the priority for this source.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Treat a missing file as empty instead of failing.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    fn validate_extension(&self) -> Result<()> {
        let extension = self
            .path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| {
                SubscriberError::LoadError(format!(
                    "Unable to determine file format for: {}",
                    self.path.display()
                ))
            })?;

        match extension {
            "yaml" | "yml" | "toml" | "json" => Ok(()),
            _ => Err(SubscriberError::LoadError(format!(
                "Unsupported file extension: {}. Supported: .yaml, .yml, .toml, .json",
                extension
            ))),
        }
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    async fn load(&self) -> Result<HashMap<String, config::Value>> {
        self.validate_extension()?;

        if !self.path.exists() {
            if self.required {
                return Err(SubscriberError::LoadError(format!(
                    "Configuration file not found: {}",
                    self.path.display()
                )));
            }
            tracing::debug!(path = %self.path.display(), "optional configuration file not present");
            return Ok(HashMap::new());
        }

        let loaded = config::Config::builder()
            .add_source(File::from(self.path.clone()).required(true))
            .build()
            .map_err(|e| SubscriberError::LoadError(format!("Failed to load file: {}", e)))?;

        loaded
            .try_deserialize::<HashMap<String, config::Value>>()
            .map_err(|e| {
                SubscriberError::DeserializationError(format!("Failed to parse file: {}", e))
            })
    }

    fn name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_validate_extension() {
        for name in ["a.yaml", "a.yml", "a.toml", "a.json"] {
            assert!(FileSource::new(name).validate_extension().is_ok(), "{}", name);
        }
        assert!(FileSource::new("a.ini").validate_extension().is_err());
        assert!(FileSource::new("appsettings").validate_extension().is_err());
    }

    #[tokio::test]
    async fn test_load_yaml_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("appsettings.yaml");
        fs::write(
            &path,
            r#"
change_subscription:
  service_bus_topic: config-changes
  auto_delete_on_idle_in_hours: 2
"#,
        )
        .unwrap();

        let map = FileSource::new(&path).load().await.unwrap();
        assert!(map.contains_key("change_subscription"));
    }

    #[tokio::test]
    async fn test_missing_required_file() {
        let result = FileSource::new("/nonexistent/appsettings.yaml").load().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_missing_optional_file() {
        let map = FileSource::new("/nonexistent/appsettings.local.yaml")
            .optional()
            .load()
            .await
            .unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_name_and_priority() {
        let source = FileSource::new("appsettings.yaml").with_priority(200);
        assert_eq!(source.priority(), 200);
        assert!(source.name().contains("appsettings.yaml"));
    }
}
