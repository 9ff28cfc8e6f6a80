//! Concurrent receive, acknowledge and retry engine.

use crate::broker::{BrokerError, Delivery, InboundMessage, MessageBroker, Subscription};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[cfg(feature = "metrics")]
use crate::metrics::SubscriberMetrics;

/// Handles one inbound message.
///
/// `Ok` completes the message; `Err` abandons it so the broker redelivers it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a message.
    ///
    /// # Errors
    ///
    /// Any error leaves the message unacknowledged.
    async fn handle(&self, message: &InboundMessage) -> Result<()>;
}

/// Pulls messages from a subscription and runs them through a handler.
///
/// Each [`run`](Self::run) attaches a fresh receiver and starts two tasks:
/// one reading messages (handling up to `max_concurrent_calls` at a time),
/// one forwarding channel-level errors to the caller's error sink.
#[derive(Clone)]
pub struct MessageLoop {
    broker: Arc<dyn MessageBroker>,
    max_concurrent_calls: usize,
    #[cfg(feature = "metrics")]
    metrics: Option<SubscriberMetrics>,
}

impl MessageLoop {
    /// Create a loop over the broker's data plane.
    pub fn new(broker: Arc<dyn MessageBroker>, max_concurrent_calls: usize) -> Self {
        Self {
            broker,
            max_concurrent_calls: max_concurrent_calls.max(1),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Record message counts and handler durations.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: SubscriberMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Attach to the subscription and start processing.
    ///
    /// Processing continues until [`LoopHandle::stop`] is called or the
    /// broker detaches the receiver.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the receiver cannot be attached.
    pub async fn run(
        &self,
        subscription: &Subscription,
        handler: Arc<dyn MessageHandler>,
        errors: mpsc::UnboundedSender<BrokerError>,
    ) -> std::result::Result<LoopHandle, BrokerError> {
        let Delivery {
            messages,
            errors: channel_errors,
        } = self.broker.open(subscription).await?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(self.clone().receive(
            messages,
            handler,
            cancel.clone(),
            tracker.clone(),
        ));
        tracker.spawn(forward_errors(channel_errors, errors, cancel.clone()));

        tracing::debug!(
            topic = %subscription.topic,
            subscription = %subscription.name,
            max_concurrent_calls = self.max_concurrent_calls,
            "message loop started"
        );

        Ok(LoopHandle {
            subscription: subscription.clone(),
            cancel,
            tracker,
        })
    }

    async fn receive(
        self,
        mut messages: mpsc::UnboundedReceiver<InboundMessage>,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        let permits = Arc::new(Semaphore::new(self.max_concurrent_calls));

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = messages.recv() => match message {
                    Some(message) => message,
                    None => {
                        tracing::debug!("message stream closed by broker");
                        break;
                    }
                },
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Stopping with a message in hand: give it back.
                    self.release(&message).await;
                    break;
                }
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = self.clone();
            let handler = Arc::clone(&handler);
            tracker.spawn(async move {
                worker.process(handler.as_ref(), message).await;
                drop(permit);
            });
        }
    }

    async fn process(&self, handler: &dyn MessageHandler, message: InboundMessage) {
        #[cfg(feature = "metrics")]
        let timer = self.metrics.as_ref().map(SubscriberMetrics::start_message);

        tracing::trace!(
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            "Received"
        );

        match handler.handle(&message).await {
            Ok(()) => {
                if let Err(e) = self.broker.complete(&message).await {
                    tracing::warn!(message_id = %message.message_id, error = %e, "failed to complete message");
                }
                #[cfg(feature = "metrics")]
                if let (Some(metrics), Some(timer)) = (&self.metrics, timer) {
                    metrics.record_completed(timer);
                }
            }
            Err(e) => {
                tracing::error!(
                    message_id = %message.message_id,
                    delivery_count = message.delivery_count,
                    error = %e,
                    "message handling failed"
                );
                self.release(&message).await;
                #[cfg(feature = "metrics")]
                if let (Some(metrics), Some(timer)) = (&self.metrics, timer) {
                    metrics.record_abandoned(timer);
                }
            }
        }
    }

    async fn release(&self, message: &InboundMessage) {
        if let Err(e) = self.broker.abandon(message).await {
            tracing::warn!(message_id = %message.message_id, error = %e, "failed to abandon message");
        }
    }
}

async fn forward_errors(
    mut channel_errors: mpsc::UnboundedReceiver<BrokerError>,
    sink: mpsc::UnboundedSender<BrokerError>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            error = channel_errors.recv() => match error {
                Some(error) => {
                    if sink.send(error).is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// A running message loop.
pub struct LoopHandle {
    subscription: Subscription,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl LoopHandle {
    /// Subscription this loop is attached to.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Whether [`stop`](Self::stop) has been requested.
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop receiving and wait for in-flight messages to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!(
            topic = %self.subscription.topic,
            subscription = %self.subscription.name,
            "message loop drained"
        );
    }
}
