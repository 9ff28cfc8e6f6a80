//! Configuration source trait.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Trait for configuration sources.
///
/// A full reload re-reads every source, so `load` is async: remote stores are
/// fetched without blocking the runtime.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Load configuration as a key-value map.
    ///
    /// Keys may be dotted paths (`change_subscription.service_bus_topic`). The
    /// returned map is merged with other sources according to priority.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be loaded or parsed.
    async fn load(&self) -> Result<HashMap<String, config::Value>>;

    /// Get a human-readable name for this source (for logging/debugging).
    fn name(&self) -> String;

    /// Get the priority of this source (higher = takes precedence).
    ///
    /// Default priorities:
    /// - Environment variables: 300
    /// - Remote store: 250
    /// - Files: 100 and up, in the order added
    fn priority(&self) -> i32 {
        100
    }
}
