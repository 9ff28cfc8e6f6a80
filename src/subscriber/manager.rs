//! Idempotent subscription setup and teardown.

use crate::broker::{BrokerError, Subscription, SubscriptionAdmin};
use crate::error::{Result, SubscriberError};
use std::sync::Arc;
use std::time::Duration;

/// Ensures the per-instance subscription exists, and removes it on shutdown.
///
/// Both operations check first and treat losing a race with another caller
/// (already exists, already gone) as success.
#[derive(Clone)]
pub struct SubscriptionManager {
    admin: Arc<dyn SubscriptionAdmin>,
}

impl SubscriptionManager {
    /// Create a manager over the broker's management plane.
    pub fn new(admin: Arc<dyn SubscriptionAdmin>) -> Self {
        Self { admin }
    }

    /// Make sure the subscription exists, creating it with the idle
    /// auto-delete policy if it does not.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriberError::SubscriptionSetup`] for any broker failure
    /// other than "already exists".
    pub async fn ensure_subscription(
        &self,
        topic: &str,
        name: &str,
        idle_timeout: Duration,
    ) -> Result<Subscription> {
        let subscription = Subscription::new(topic, name, idle_timeout);
        let setup_error = |source: BrokerError| SubscriberError::SubscriptionSetup {
            topic: topic.to_string(),
            subscription: name.to_string(),
            source,
        };

        if self
            .admin
            .subscription_exists(topic, name)
            .await
            .map_err(setup_error)?
        {
            tracing::trace!(topic, subscription = name, "subscription already present");
            return Ok(subscription);
        }

        match self.admin.create_subscription(&subscription).await {
            Ok(()) => {
                tracing::debug!(
                    topic,
                    subscription = name,
                    idle_secs = idle_timeout.as_secs(),
                    "subscription created"
                );
                Ok(subscription)
            }
            Err(e) if e.is_already_exists() => {
                tracing::trace!(topic, subscription = name, error = %e, "subscription created concurrently");
                Ok(subscription)
            }
            Err(e) => Err(setup_error(e)),
        }
    }

    /// Delete the subscription if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error for any broker failure other than "not found".
    pub async fn remove_subscription(&self, topic: &str, name: &str) -> Result<()> {
        match self.admin.subscription_exists(topic, name).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::trace!(topic, subscription = name, "subscription already absent");
                return Ok(());
            }
            Err(e) if e.is_entity_not_found() => {
                tracing::trace!(topic, subscription = name, error = %e, "topic already absent");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        match self.admin.delete_subscription(topic, name).await {
            Ok(()) => {
                tracing::debug!(topic, subscription = name, "subscription deleted");
                Ok(())
            }
            Err(e) if e.is_entity_not_found() => {
                tracing::trace!(topic, subscription = name, error = %e, "subscription deleted concurrently");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
