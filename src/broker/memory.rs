//! In-process broker with topics, durable subscriptions and peek-lock delivery.

use super::{
    BrokerClients, BrokerConnector, BrokerCredential, BrokerError, Delivery, InboundMessage,
    MessageBroker, Subscription, SubscriptionAdmin,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Deliveries after which an abandoned message is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: Bytes,
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
}

struct Attached {
    messages: mpsc::UnboundedSender<InboundMessage>,
    errors: mpsc::UnboundedSender<BrokerError>,
}

struct SubscriptionState {
    auto_delete_on_idle: Duration,
    last_activity: Instant,
    backlog: VecDeque<StoredMessage>,
    locked: HashMap<String, StoredMessage>,
    dead_letters: Vec<StoredMessage>,
    receiver: Option<Attached>,
}

impl SubscriptionState {
    fn new(auto_delete_on_idle: Duration) -> Self {
        Self {
            auto_delete_on_idle,
            last_activity: Instant::now(),
            backlog: VecDeque::new(),
            locked: HashMap::new(),
            dead_letters: Vec::new(),
            receiver: None,
        }
    }

    fn has_live_receiver(&self) -> bool {
        self.receiver
            .as_ref()
            .is_some_and(|receiver| !receiver.messages.is_closed())
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Hand a message to the attached receiver, or keep it in the backlog.
    fn deliver(&mut self, mut message: StoredMessage) {
        let Some(receiver) = &self.receiver else {
            self.backlog.push_back(message);
            return;
        };

        message.delivery_count += 1;
        let lock_token = uuid::Uuid::new_v4().to_string();
        let inbound = InboundMessage {
            message_id: message.message_id.clone(),
            lock_token: lock_token.clone(),
            body: message.body.clone(),
            delivery_count: message.delivery_count,
            enqueued_at: message.enqueued_at,
        };

        if receiver.messages.send(inbound).is_ok() {
            self.locked.insert(lock_token, message);
        } else {
            // Receiver went away without detaching
            message.delivery_count -= 1;
            self.receiver = None;
            self.backlog.push_front(message);
        }
    }

    fn drain_backlog(&mut self) {
        while self.receiver.is_some() {
            let Some(message) = self.backlog.pop_front() else {
                break;
            };
            self.deliver(message);
        }
    }
}

#[derive(Default)]
struct BrokerState {
    topics: HashSet<String>,
    subscriptions: HashMap<(String, String), SubscriptionState>,
    create_calls: usize,
    delete_calls: usize,
    open_calls: usize,
    next_message_id: u64,
}

impl BrokerState {
    fn find_locked(&mut self, lock_token: &str) -> Option<&mut SubscriptionState> {
        self.subscriptions
            .values_mut()
            .find(|state| state.locked.contains_key(lock_token))
    }
}

/// An in-process broker implementing both broker planes.
///
/// Cloning shares the same broker. Time-based behavior (idle auto-delete) uses
/// tokio's clock, so paused-time tests can drive it.
///
/// # Examples
///
/// ```rust
/// use config_change_subscriber::broker::{InMemoryBroker, Subscription, SubscriptionAdmin};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new().with_topic("config-changes");
/// let sub = Subscription::new("config-changes", "api-host1", Duration::from_secs(3600));
/// broker.create_subscription(&sub).await?;
///
/// broker.publish("config-changes", r#"{"eventType":"x"}"#)?;
/// assert_eq!(broker.backlog_len("config-changes", "api-host1"), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    max_delivery_count: u32,
    accepted_credential: Option<BrokerCredential>,
}

impl InMemoryBroker {
    /// Create an empty broker with no topics.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            accepted_credential: None,
        }
    }

    /// Create a topic up front.
    pub fn with_topic(self, topic: impl Into<String>) -> Self {
        self.create_topic(topic);
        self
    }

    /// Set how many deliveries an abandoned message gets before dead-lettering.
    pub fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = max_delivery_count.max(1);
        self
    }

    /// Only accept this credential in [`BrokerConnector::connect`].
    pub fn with_accepted_credential(mut self, credential: BrokerCredential) -> Self {
        self.accepted_credential = Some(credential);
        self
    }

    /// Create a topic; no-op if it exists.
    pub fn create_topic(&self, topic: impl Into<String>) {
        self.state.lock().topics.insert(topic.into());
    }

    /// Publish a message to every subscription of a topic.
    ///
    /// Returns the number of subscriptions the message was enqueued on.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::EntityNotFound`] if the topic does not exist.
    pub fn publish(&self, topic: &str, body: impl Into<Bytes>) -> Result<usize, BrokerError> {
        let body = body.into();
        let mut state = self.state.lock();
        if !state.topics.contains(topic) {
            return Err(BrokerError::EntityNotFound(topic.to_string()));
        }

        state.next_message_id += 1;
        let message = StoredMessage {
            message_id: format!("msg-{}", state.next_message_id),
            body,
            delivery_count: 0,
            enqueued_at: Utc::now(),
        };

        let mut fan_out = 0;
        for ((sub_topic, _), sub) in state.subscriptions.iter_mut() {
            if sub_topic == topic {
                sub.touch();
                sub.deliver(message.clone());
                fan_out += 1;
            }
        }
        Ok(fan_out)
    }

    /// Push a channel-level error to the receiver attached to a subscription.
    ///
    /// Returns `false` if no receiver is attached.
    pub fn inject_error(&self, topic: &str, name: &str, error: BrokerError) -> bool {
        let state = self.state.lock();
        state
            .subscriptions
            .get(&(topic.to_string(), name.to_string()))
            .and_then(|sub| sub.receiver.as_ref())
            .is_some_and(|receiver| receiver.errors.send(error).is_ok())
    }

    /// Delete every subscription that has had no receiver and no traffic for
    /// its idle period. Returns the deleted subscription names.
    pub fn expire_idle(&self) -> Vec<String> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<(String, String)> = state
            .subscriptions
            .iter()
            .filter(|(_, sub)| {
                !sub.has_live_receiver()
                    && now.duration_since(sub.last_activity) >= sub.auto_delete_on_idle
            })
            .map(|(key, _)| key.clone())
            .collect();

        for (topic, name) in &expired {
            state.subscriptions.remove(&(topic.clone(), name.clone()));
            tracing::debug!(topic = %topic, subscription = %name, "subscription expired after idle period");
        }
        expired.into_iter().map(|(_, name)| name).collect()
    }

    /// Number of subscriptions on a topic.
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .keys()
            .filter(|(t, _)| t == topic)
            .count()
    }

    /// Messages waiting for a receiver.
    pub fn backlog_len(&self, topic: &str, name: &str) -> usize {
        self.with_subscription(topic, name, |sub| sub.backlog.len())
    }

    /// Messages delivered but not yet settled.
    pub fn locked_len(&self, topic: &str, name: &str) -> usize {
        self.with_subscription(topic, name, |sub| sub.locked.len())
    }

    /// Messages moved to the dead-letter queue.
    pub fn dead_letter_len(&self, topic: &str, name: &str) -> usize {
        self.with_subscription(topic, name, |sub| sub.dead_letters.len())
    }

    /// Whether a receiver is currently attached.
    pub fn is_attached(&self, topic: &str, name: &str) -> bool {
        self.with_subscription(topic, name, SubscriptionState::has_live_receiver)
    }

    /// Total `create_subscription` calls that created a subscription.
    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    /// Total `delete_subscription` calls that deleted a subscription.
    pub fn delete_calls(&self) -> usize {
        self.state.lock().delete_calls
    }

    /// Total successful `open` calls.
    pub fn open_calls(&self) -> usize {
        self.state.lock().open_calls
    }

    fn with_subscription<R, F>(&self, topic: &str, name: &str, f: F) -> R
    where
        R: Default,
        F: FnOnce(&SubscriptionState) -> R,
    {
        self.state
            .lock()
            .subscriptions
            .get(&(topic.to_string(), name.to_string()))
            .map(f)
            .unwrap_or_default()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionAdmin for InMemoryBroker {
    async fn subscription_exists(&self, topic: &str, name: &str) -> Result<bool, BrokerError> {
        let state = self.state.lock();
        if !state.topics.contains(topic) {
            return Err(BrokerError::EntityNotFound(topic.to_string()));
        }
        Ok(state
            .subscriptions
            .contains_key(&(topic.to_string(), name.to_string())))
    }

    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if !state.topics.contains(&subscription.topic) {
            return Err(BrokerError::EntityNotFound(subscription.topic.clone()));
        }

        let key = (subscription.topic.clone(), subscription.name.clone());
        if state.subscriptions.contains_key(&key) {
            return Err(BrokerError::AlreadyExists(subscription.path()));
        }

        state.subscriptions.insert(
            key,
            SubscriptionState::new(subscription.auto_delete_on_idle),
        );
        state.create_calls += 1;
        Ok(())
    }

    async fn delete_subscription(&self, topic: &str, name: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let removed = state
            .subscriptions
            .remove(&(topic.to_string(), name.to_string()))
            .ok_or_else(|| BrokerError::EntityNotFound(format!("{}/Subscriptions/{}", topic, name)))?;
        state.delete_calls += 1;

        // An attached receiver learns about the deletion on its error channel;
        // dropping the senders closes its message stream.
        if let Some(receiver) = removed.receiver {
            let _ = receiver.errors.send(BrokerError::EntityNotFound(format!(
                "{}/Subscriptions/{}",
                topic, name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn open(&self, subscription: &Subscription) -> Result<Delivery, BrokerError> {
        let mut state = self.state.lock();
        let key = (subscription.topic.clone(), subscription.name.clone());
        let sub = state
            .subscriptions
            .get_mut(&key)
            .ok_or_else(|| BrokerError::EntityNotFound(subscription.path()))?;

        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        // A new receiver takes over; unsettled deliveries of the previous one
        // go back to the front of the backlog.
        let mut unsettled: Vec<StoredMessage> = sub.locked.drain().map(|(_, m)| m).collect();
        unsettled.sort_by(|a, b| b.enqueued_at.cmp(&a.enqueued_at));
        for message in unsettled {
            sub.backlog.push_front(message);
        }

        sub.receiver = Some(Attached {
            messages: message_tx,
            errors: error_tx,
        });
        sub.touch();
        sub.drain_backlog();
        state.open_calls += 1;

        Ok(Delivery {
            messages: message_rx,
            errors: error_rx,
        })
    }

    async fn complete(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let sub = state
            .find_locked(&message.lock_token)
            .ok_or_else(|| BrokerError::LockLost(message.message_id.clone()))?;
        sub.locked.remove(&message.lock_token);
        sub.touch();
        Ok(())
    }

    async fn abandon(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        let max_delivery_count = self.max_delivery_count;
        let mut state = self.state.lock();
        let sub = state
            .find_locked(&message.lock_token)
            .ok_or_else(|| BrokerError::LockLost(message.message_id.clone()))?;

        let Some(stored) = sub.locked.remove(&message.lock_token) else {
            return Err(BrokerError::LockLost(message.message_id.clone()));
        };
        sub.touch();

        if stored.delivery_count >= max_delivery_count {
            tracing::warn!(
                message_id = %stored.message_id,
                delivery_count = stored.delivery_count,
                "max delivery count reached, dead-lettering message"
            );
            sub.dead_letters.push(stored);
        } else {
            sub.deliver(stored);
        }
        Ok(())
    }
}

impl BrokerConnector for InMemoryBroker {
    fn connect(&self, credential: &BrokerCredential) -> Result<BrokerClients, BrokerError> {
        if let Some(accepted) = &self.accepted_credential {
            if accepted != credential {
                return Err(BrokerError::Unauthorized(format!(
                    "credential for {} rejected",
                    credential.endpoint().unwrap_or_else(|| "unknown endpoint".to_string())
                )));
            }
        }

        Ok(BrokerClients {
            admin: Arc::new(self.clone()),
            messages: Arc::new(self.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "config-changes";

    fn subscription(name: &str) -> Subscription {
        Subscription::new(TOPIC, name, Duration::from_secs(3600))
    }

    async fn broker_with(name: &str) -> InMemoryBroker {
        let broker = InMemoryBroker::new().with_topic(TOPIC);
        broker.create_subscription(&subscription(name)).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_create_twice_reports_already_exists() {
        let broker = broker_with("a").await;
        let err = broker.create_subscription(&subscription("a")).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(broker.subscription_count(TOPIC), 1);
    }

    #[tokio::test]
    async fn test_missing_topic() {
        let broker = InMemoryBroker::new();
        let err = broker.create_subscription(&subscription("a")).await.unwrap_err();
        assert!(err.is_entity_not_found());
    }

    #[tokio::test]
    async fn test_publish_fans_out() {
        let broker = broker_with("a").await;
        broker.create_subscription(&subscription("b")).await.unwrap();

        assert_eq!(broker.publish(TOPIC, "hello").unwrap(), 2);
        assert_eq!(broker.backlog_len(TOPIC, "a"), 1);
        assert_eq!(broker.backlog_len(TOPIC, "b"), 1);
    }

    #[tokio::test]
    async fn test_open_drains_backlog_and_complete_settles() {
        let broker = broker_with("a").await;
        broker.publish(TOPIC, "hello").unwrap();

        let mut delivery = broker.open(&subscription("a")).await.unwrap();
        let message = delivery.messages.recv().await.unwrap();
        assert_eq!(message.body, Bytes::from("hello"));
        assert_eq!(message.delivery_count, 1);
        assert_eq!(broker.locked_len(TOPIC, "a"), 1);

        broker.complete(&message).await.unwrap();
        assert_eq!(broker.locked_len(TOPIC, "a"), 0);

        let err = broker.complete(&message).await.unwrap_err();
        assert!(matches!(err, BrokerError::LockLost(_)));
    }

    #[tokio::test]
    async fn test_abandon_redelivers_then_dead_letters() {
        let broker = broker_with("a").await.with_max_delivery_count(2);
        broker.publish(TOPIC, "poison").unwrap();
        let mut delivery = broker.open(&subscription("a")).await.unwrap();

        let first = delivery.messages.recv().await.unwrap();
        broker.abandon(&first).await.unwrap();

        let second = delivery.messages.recv().await.unwrap();
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.delivery_count, 2);
        assert_ne!(second.lock_token, first.lock_token);

        broker.abandon(&second).await.unwrap();
        assert_eq!(broker.dead_letter_len(TOPIC, "a"), 1);
        assert_eq!(broker.locked_len(TOPIC, "a"), 0);
    }

    #[tokio::test]
    async fn test_delete_while_attached_reports_not_found() {
        let broker = broker_with("a").await;
        let mut delivery = broker.open(&subscription("a")).await.unwrap();

        broker.delete_subscription(TOPIC, "a").await.unwrap();

        let err = delivery.errors.recv().await.unwrap();
        assert!(err.is_entity_not_found());
        assert!(delivery.messages.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_open_missing_subscription() {
        let broker = InMemoryBroker::new().with_topic(TOPIC);
        let err = broker.open(&subscription("a")).await.err().unwrap();
        assert!(err.is_entity_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_idle_skips_attached() {
        let broker = broker_with("idle").await;
        broker.create_subscription(&subscription("busy")).await.unwrap();
        let _delivery = broker.open(&subscription("busy")).await.unwrap();

        tokio::time::advance(Duration::from_secs(3601)).await;

        assert_eq!(broker.expire_idle(), vec!["idle".to_string()]);
        assert_eq!(broker.subscription_count(TOPIC), 1);
    }

    #[tokio::test]
    async fn test_inject_error() {
        let broker = broker_with("a").await;
        assert!(!broker.inject_error(TOPIC, "a", BrokerError::Transport("x".into())));

        let mut delivery = broker.open(&subscription("a")).await.unwrap();
        assert!(broker.inject_error(TOPIC, "a", BrokerError::Transport("x".into())));
        assert_eq!(
            delivery.errors.recv().await.unwrap(),
            BrokerError::Transport("x".into())
        );
    }

    #[test]
    fn test_connect_rejects_other_credential() {
        let broker = InMemoryBroker::new().with_accepted_credential(
            BrokerCredential::ConnectionString("Endpoint=sb://a/".to_string()),
        );
        let other = BrokerCredential::ConnectionString("Endpoint=sb://b/".to_string());
        assert!(matches!(
            broker.connect(&other).err(),
            Some(BrokerError::Unauthorized(_))
        ));
    }
}
