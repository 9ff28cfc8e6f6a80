//! Change subscription settings.

use crate::error::{Result, SubscriberError, ValidationError};
use serde::Deserialize;
use std::time::Duration;

#[cfg(feature = "validation")]
use crate::core::Validate;

/// Staleness window used when none is configured.
pub const DEFAULT_MAX_STALENESS: Duration = Duration::from_secs(30);

/// Settings for the change-notification subscription.
///
/// Deserialized from the `change_subscription` section of the service
/// configuration (or any source via the layered loader).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeSubscriptionSettings {
    /// Shared access connection string, used in development
    #[serde(default)]
    pub service_bus_connection_string: Option<String>,
    /// Namespace URL or host, used with managed identity
    #[serde(default)]
    pub service_bus_namespace: Option<String>,
    /// Topic the change notifications are published to
    pub service_bus_topic: String,
    /// Logical subscription name; the instance discriminator is appended
    pub service_bus_subscription_prefix: String,
    /// Idle period before the broker reclaims an abandoned subscription
    pub auto_delete_on_idle_in_hours: u32,
    /// Upper bound before a pushed change marks the cache dirty
    #[serde(default)]
    pub max_delay_before_cache_is_marked_dirty_in_seconds: Option<u64>,
    /// Messages handled concurrently
    #[serde(default)]
    pub max_concurrent_calls: Option<usize>,
}

impl ChangeSubscriptionSettings {
    /// Minimal settings for a topic and subscription prefix, idle expiry of one day.
    pub fn new(topic: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            service_bus_connection_string: None,
            service_bus_namespace: None,
            service_bus_topic: topic.into(),
            service_bus_subscription_prefix: prefix.into(),
            auto_delete_on_idle_in_hours: 24,
            max_delay_before_cache_is_marked_dirty_in_seconds: None,
            max_concurrent_calls: None,
        }
    }

    /// Subscription name for a given instance: `{prefix}-{instance}`.
    pub fn subscription_name(&self, instance: &str) -> String {
        format!("{}-{}", self.service_bus_subscription_prefix, instance)
    }

    /// Subscription name for this machine, discriminated by host name.
    ///
    /// # Errors
    ///
    /// Returns an error if the host name cannot be read or is not valid UTF-8.
    pub fn subscription_name_for_host(&self) -> Result<String> {
        let host = hostname::get()?
            .into_string()
            .map_err(|_| SubscriberError::Other("host name is not valid UTF-8".to_string()))?;
        Ok(self.subscription_name(&host))
    }

    /// Namespace host with any `https://` scheme and `:443/` port suffix removed.
    pub fn namespace(&self) -> Option<String> {
        self.service_bus_namespace
            .as_deref()
            .map(|ns| ns.replace("https://", "").replace(":443/", ""))
            .map(|ns| ns.trim_end_matches('/').to_string())
            .filter(|ns| !ns.is_empty())
    }

    /// Idle period after which the broker deletes the subscription.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.auto_delete_on_idle_in_hours) * 3600)
    }

    /// Staleness window handed to push notifications.
    pub fn max_staleness(&self) -> Duration {
        self.max_delay_before_cache_is_marked_dirty_in_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_MAX_STALENESS)
    }

    /// Bound on concurrently handled messages (the broker processor default is 1).
    pub fn concurrency(&self) -> usize {
        self.max_concurrent_calls.unwrap_or(1)
    }

    pub(crate) fn check(&self) -> std::result::Result<(), ValidationError> {
        let mut errors = Vec::new();
        if self.service_bus_topic.trim().is_empty() {
            errors.push(ValidationError::invalid_field(
                "service_bus_topic",
                "must not be empty",
            ));
        }
        if self.service_bus_subscription_prefix.trim().is_empty() {
            errors.push(ValidationError::invalid_field(
                "service_bus_subscription_prefix",
                "must not be empty",
            ));
        }
        if self.auto_delete_on_idle_in_hours == 0 {
            errors.push(ValidationError::invalid_field(
                "auto_delete_on_idle_in_hours",
                "must be at least 1",
            ));
        }
        if self.max_concurrent_calls == Some(0) {
            errors.push(ValidationError::invalid_field(
                "max_concurrent_calls",
                "must be greater than 0",
            ));
        }
        ValidationError::from_all(errors)
    }
}

#[cfg(feature = "validation")]
impl Validate for ChangeSubscriptionSettings {
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        self.check()
    }
}
