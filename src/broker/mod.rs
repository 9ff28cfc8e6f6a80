//! Message broker abstraction.
//!
//! The subscriber talks to the broker through two planes:
//! - [`SubscriptionAdmin`]: the management plane (create, inspect, delete subscriptions)
//! - [`MessageBroker`]: the data plane (receive, complete, abandon messages)
//!
//! Both are resolved once at startup from a [`BrokerCredential`] through a
//! [`BrokerConnector`]. [`InMemoryBroker`] implements all of them in-process.

mod credential;
mod error;
mod memory;

pub use credential::BrokerCredential;
pub use error::BrokerError;
pub use memory::InMemoryBroker;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A durable subscription bound to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic the subscription receives from
    pub topic: String,
    /// Subscription name, unique per running instance
    pub name: String,
    /// Idle period after which the broker deletes the subscription
    pub auto_delete_on_idle: Duration,
}

impl Subscription {
    /// Create a subscription descriptor.
    pub fn new(
        topic: impl Into<String>,
        name: impl Into<String>,
        auto_delete_on_idle: Duration,
    ) -> Self {
        Self {
            topic: topic.into(),
            name: name.into(),
            auto_delete_on_idle,
        }
    }

    /// Broker-style entity path, e.g. `changes/Subscriptions/api-host1`.
    pub fn path(&self) -> String {
        format!("{}/Subscriptions/{}", self.topic, self.name)
    }
}

/// A message delivered under a peek-lock.
///
/// The lock token identifies this particular delivery; settling with a stale
/// token fails with [`BrokerError::LockLost`].
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Broker-assigned message id, stable across redeliveries
    pub message_id: String,
    /// Token for settling this delivery
    pub lock_token: String,
    /// Raw message body
    pub body: Bytes,
    /// Number of times this message has been delivered, starting at 1
    pub delivery_count: u32,
    /// When the message was enqueued on the subscription
    pub enqueued_at: DateTime<Utc>,
}

/// Receiving side of an open subscription.
///
/// Messages and errors arrive on independent channels so that a slow handler
/// never holds up error reporting. Both channels close when the broker
/// detaches the receiver.
pub struct Delivery {
    /// Inbound messages
    pub messages: mpsc::UnboundedReceiver<InboundMessage>,
    /// Channel-level errors
    pub errors: mpsc::UnboundedReceiver<BrokerError>,
}

/// Management plane of the broker.
#[async_trait]
pub trait SubscriptionAdmin: Send + Sync {
    /// Check whether a subscription exists.
    async fn subscription_exists(&self, topic: &str, name: &str) -> Result<bool, BrokerError>;

    /// Create a subscription. Fails with [`BrokerError::AlreadyExists`] on a name clash.
    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), BrokerError>;

    /// Delete a subscription. Fails with [`BrokerError::EntityNotFound`] if absent.
    async fn delete_subscription(&self, topic: &str, name: &str) -> Result<(), BrokerError>;
}

/// Data plane of the broker.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Attach a receiver to a subscription.
    async fn open(&self, subscription: &Subscription) -> Result<Delivery, BrokerError>;

    /// Settle a message as processed; it will not be redelivered.
    async fn complete(&self, message: &InboundMessage) -> Result<(), BrokerError>;

    /// Release a message's lock so the broker redelivers it.
    async fn abandon(&self, message: &InboundMessage) -> Result<(), BrokerError>;
}

/// Clients for both broker planes, built from one credential.
#[derive(Clone)]
pub struct BrokerClients {
    /// Management plane
    pub admin: Arc<dyn SubscriptionAdmin>,
    /// Data plane
    pub messages: Arc<dyn MessageBroker>,
}

/// Turns a resolved credential into broker clients.
pub trait BrokerConnector: Send + Sync {
    /// Connect to the broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential is rejected.
    fn connect(&self, credential: &BrokerCredential) -> Result<BrokerClients, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_path() {
        let sub = Subscription::new("changes", "api-host1", Duration::from_secs(3600));
        assert_eq!(sub.path(), "changes/Subscriptions/api-host1");
    }
}
