//! Recovery from lost subscriptions.

use super::manager::SubscriptionManager;
use super::message_loop::{LoopHandle, MessageHandler, MessageLoop};
use crate::broker::{BrokerError, Subscription};
use crate::error::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[cfg(feature = "metrics")]
use crate::metrics::SubscriberMetrics;

/// Failed attempts after which a recovery that is still retrying is logged
/// at error level.
pub const ESCALATE_AFTER_ATTEMPTS: u32 = 5;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Health of the subscription channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelHealth {
    /// Receiving normally
    Healthy,
    /// Re-creating the subscription and restarting the loop
    Recovering,
}

/// What the handler did with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Logged only; the broker's own retry applies
    Transient,
    /// A recovery was started
    Resubscribe,
    /// The subscription is gone but a recovery is already running
    AlreadyRecovering,
}

struct Inner {
    manager: SubscriptionManager,
    message_loop: MessageLoop,
    handler: Arc<dyn MessageHandler>,
    subscription: Subscription,
    errors: mpsc::UnboundedSender<BrokerError>,
    active: Mutex<Option<LoopHandle>>,
    recovering: AtomicBool,
    recoveries: AtomicU64,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

/// Watches channel errors and re-establishes the subscription when the
/// broker reports it gone.
///
/// Error handling never blocks: a recovery runs on its own task, and at most
/// one runs at a time. Errors arriving meanwhile are absorbed. A recovery
/// keeps retrying with capped backoff until it succeeds or the handler is
/// stopped.
#[derive(Clone)]
pub struct RecoveryHandler {
    inner: Arc<Inner>,
    #[cfg(feature = "metrics")]
    metrics: Option<SubscriberMetrics>,
}

impl RecoveryHandler {
    /// Create a handler for one subscription.
    ///
    /// `errors` is the sink every loop it starts reports channel errors to.
    pub fn new(
        manager: SubscriptionManager,
        message_loop: MessageLoop,
        handler: Arc<dyn MessageHandler>,
        subscription: Subscription,
        errors: mpsc::UnboundedSender<BrokerError>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                message_loop,
                handler,
                subscription,
                errors,
                active: Mutex::new(None),
                recovering: AtomicBool::new(false),
                recoveries: AtomicU64::new(0),
                tasks: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Record transport errors and recoveries started through this handle.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: SubscriberMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Subscription being kept alive.
    pub fn subscription(&self) -> &Subscription {
        &self.inner.subscription
    }

    /// Current channel health.
    pub fn health(&self) -> ChannelHealth {
        if self.inner.recovering.load(Ordering::Acquire) {
            ChannelHealth::Recovering
        } else {
            ChannelHealth::Healthy
        }
    }

    /// Completed recoveries.
    pub fn recoveries(&self) -> u64 {
        self.inner.recoveries.load(Ordering::Acquire)
    }

    /// Ensure the subscription and start the message loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be created or opened.
    pub async fn start(&self) -> Result<()> {
        self.inner.restart().await
    }

    /// Decide what an error calls for, without acting on it.
    pub fn decide(&self, error: &BrokerError) -> RecoveryDecision {
        if !error.is_entity_not_found() {
            RecoveryDecision::Transient
        } else if self.health() == ChannelHealth::Recovering {
            RecoveryDecision::AlreadyRecovering
        } else {
            RecoveryDecision::Resubscribe
        }
    }

    /// React to a channel error. Returns immediately; a recovery, if
    /// needed, runs in the background.
    pub fn on_error(&self, error: BrokerError) -> RecoveryDecision {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_transport_error();
        }

        if !error.is_entity_not_found() {
            tracing::error!(
                subscription = %self.inner.subscription.name,
                error = %error,
                "broker error"
            );
            return RecoveryDecision::Transient;
        }

        if self.inner.cancel.is_cancelled() {
            tracing::debug!(error = %error, "subscription gone while stopping");
            return RecoveryDecision::Transient;
        }

        if self
            .inner
            .recovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(error = %error, "recovery already in progress");
            return RecoveryDecision::AlreadyRecovering;
        }

        let inner = Arc::clone(&self.inner);
        #[cfg(feature = "metrics")]
        let metrics = self.metrics.clone();
        self.inner.tasks.spawn(async move {
            if inner.recover(error).await {
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &metrics {
                    metrics.record_recovery();
                }
            }
            inner.recovering.store(false, Ordering::Release);
        });
        RecoveryDecision::Resubscribe
    }

    /// Wait for any running recovery, then stop the active loop.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        if let Some(handle) = self.inner.active.lock().await.take() {
            handle.stop().await;
        }
    }
}

impl Inner {
    async fn restart(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.stop().await;
        }

        let subscription = self
            .manager
            .ensure_subscription(
                &self.subscription.topic,
                &self.subscription.name,
                self.subscription.auto_delete_on_idle,
            )
            .await?;

        let handle = self
            .message_loop
            .run(&subscription, Arc::clone(&self.handler), self.errors.clone())
            .await?;
        *active = Some(handle);
        Ok(())
    }

    /// Retry until the loop is running again. Returns `false` if the
    /// handler was stopped first.
    async fn recover(&self, cause: BrokerError) -> bool {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.restart().await {
                Ok(()) => {
                    self.recoveries.fetch_add(1, Ordering::AcqRel);
                    tracing::info!(
                        topic = %self.subscription.topic,
                        subscription = %self.subscription.name,
                        cause = %cause,
                        attempt,
                        "Topic subscription re-established"
                    );
                    return true;
                }
                Err(e) if attempt >= ESCALATE_AFTER_ATTEMPTS => {
                    tracing::error!(
                        subscription = %self.subscription.name,
                        attempt,
                        retry_in = ?backoff,
                        error = %e,
                        "subscription still unavailable"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        subscription = %self.subscription.name,
                        attempt,
                        error = %e,
                        "subscription recovery attempt failed"
                    );
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, InboundMessage, SubscriptionAdmin};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const TOPIC: &str = "config-changes";

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, _message: &InboundMessage) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn handler_for(
        broker: &InMemoryBroker,
        handler: Arc<Counting>,
    ) -> (RecoveryHandler, mpsc::UnboundedReceiver<BrokerError>) {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let subscription = Subscription::new(TOPIC, "api-host1", Duration::from_secs(3600));
        let recovery = RecoveryHandler::new(
            SubscriptionManager::new(Arc::new(broker.clone())),
            MessageLoop::new(Arc::new(broker.clone()), 1),
            handler,
            subscription,
            errors_tx,
        );
        (recovery, errors_rx)
    }

    #[test]
    fn test_decide() {
        let broker = InMemoryBroker::new();
        let (recovery, _rx) = handler_for(&broker, Arc::default());

        assert_eq!(
            recovery.decide(&BrokerError::Transport("socket closed".into())),
            RecoveryDecision::Transient
        );
        assert_eq!(
            recovery.decide(&BrokerError::EntityNotFound("changes/Subscriptions/a".into())),
            RecoveryDecision::Resubscribe
        );
        assert_eq!(
            recovery.decide(&BrokerError::Transport(
                "The messaging entity 'sb://ns/changes/Subscriptions/a' could not be found.".into()
            )),
            RecoveryDecision::Resubscribe
        );
    }

    #[tokio::test]
    async fn test_transient_error_leaves_subscription_alone() {
        let broker = InMemoryBroker::new().with_topic(TOPIC);
        let (recovery, _rx) = handler_for(&broker, Arc::default());
        recovery.start().await.unwrap();

        let decision = recovery.on_error(BrokerError::Transport("connection reset".into()));

        assert_eq!(decision, RecoveryDecision::Transient);
        assert_eq!(recovery.health(), ChannelHealth::Healthy);
        assert_eq!(broker.create_calls(), 1);
        assert_eq!(broker.open_calls(), 1);
        assert!(broker.is_attached(TOPIC, "api-host1"));
        recovery.stop().await;
    }

    #[tokio::test]
    async fn test_not_found_recreates_once_and_resumes() {
        let broker = InMemoryBroker::new().with_topic(TOPIC);
        let counting = Arc::new(Counting::default());
        let (recovery, _rx) = handler_for(&broker, counting.clone());
        recovery.start().await.unwrap();

        broker.delete_subscription(TOPIC, "api-host1").await.unwrap();

        let gone = BrokerError::EntityNotFound("config-changes/Subscriptions/api-host1".into());
        assert_eq!(recovery.on_error(gone.clone()), RecoveryDecision::Resubscribe);
        assert_eq!(recovery.on_error(gone), RecoveryDecision::AlreadyRecovering);

        for _ in 0..100 {
            if recovery.recoveries() == 1 && recovery.health() == ChannelHealth::Healthy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recovery.recoveries(), 1);
        assert_eq!(broker.create_calls(), 2);
        assert_eq!(broker.subscription_count(TOPIC), 1);

        broker.publish(TOPIC, "after").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);

        recovery.stop().await;
    }

    #[tokio::test]
    async fn test_errors_after_stop_do_not_recover() {
        let broker = InMemoryBroker::new().with_topic(TOPIC);
        let (recovery, _rx) = handler_for(&broker, Arc::default());
        recovery.start().await.unwrap();
        recovery.stop().await;

        let decision = recovery.on_error(BrokerError::EntityNotFound("gone".into()));
        assert_eq!(decision, RecoveryDecision::Transient);
        assert_eq!(broker.create_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_retries_until_topic_returns() {
        let broker = InMemoryBroker::new();
        let (recovery, _rx) = handler_for(&broker, Arc::default());

        assert_eq!(
            recovery.on_error(BrokerError::EntityNotFound("config-changes".into())),
            RecoveryDecision::Resubscribe
        );

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(recovery.health(), ChannelHealth::Recovering);
        broker.create_topic(TOPIC);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recovery.health(), ChannelHealth::Healthy);
        assert_eq!(recovery.recoveries(), 1);
        assert!(broker.is_attached(TOPIC, "api-host1"));

        recovery.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_outlasts_long_outage() {
        let broker = InMemoryBroker::new();
        let counting = Arc::new(Counting::default());
        let (recovery, _rx) = handler_for(&broker, counting.clone());

        recovery.on_error(BrokerError::EntityNotFound("config-changes".into()));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(recovery.health(), ChannelHealth::Recovering);
        assert_eq!(recovery.recoveries(), 0);

        broker.create_topic(TOPIC);
        tokio::time::sleep(MAX_BACKOFF + Duration::from_secs(1)).await;

        assert_eq!(recovery.health(), ChannelHealth::Healthy);
        assert_eq!(recovery.recoveries(), 1);
        assert!(broker.is_attached(TOPIC, "api-host1"));

        broker.publish(TOPIC, "after outage").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);

        recovery.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_pending_recovery() {
        let broker = InMemoryBroker::new();
        let (recovery, _rx) = handler_for(&broker, Arc::default());

        recovery.on_error(BrokerError::EntityNotFound("config-changes".into()));
        tokio::time::sleep(Duration::from_secs(10)).await;

        recovery.stop().await;
        assert_eq!(recovery.recoveries(), 0);
        assert_eq!(recovery.health(), ChannelHealth::Healthy);
        assert!(!broker.is_attached(TOPIC, "api-host1"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_attach_after_clone() {
        let broker = InMemoryBroker::new();
        let (recovery, _rx) = handler_for(&broker, Arc::default());
        let _shared = recovery.clone();

        let recovery = recovery.with_metrics(SubscriberMetrics::new(opentelemetry::global::meter("test")));
        assert!(recovery.metrics.is_some());
    }
}
