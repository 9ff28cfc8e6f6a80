//! Dispatch of classified events to the refresh collaborators.

use super::classifier::{ChangeEvent, EventClassifier, VaultEventKind, VaultObjectEvent};
use super::message_loop::MessageHandler;
use crate::broker::InboundMessage;
use crate::error::{Result, SubscriberError};
use crate::refresh::{
    AUTO_UPDATE_SECRETS_TOGGLE, ConfigurationRefresher, ConfigurationRoot, FeatureToggles,
    PushNotification,
};
use crate::settings::DEFAULT_MAX_STALENESS;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

#[cfg(feature = "metrics")]
use crate::metrics::SubscriberMetrics;

/// Why a recognized event was intentionally ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The auto-update toggle is off
    ToggleDisabled,
    /// The vault event does not announce a new version
    NotActionable(VaultEventKind),
    /// No push-notification refresher is configured
    NoRefresher,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToggleDisabled => write!(f, "toggle '{}' disabled", AUTO_UPDATE_SECRETS_TOGGLE),
            Self::NotActionable(kind) => write!(f, "vault event {} is not actionable", kind),
            Self::NoRefresher => f.write_str("no refresher configured"),
        }
    }
}

/// Result of dispatching one event.
#[derive(Debug)]
pub enum RefreshOutcome {
    /// The refresh action ran
    Applied,
    /// The event was recognized and deliberately ignored
    Skipped(SkipReason),
    /// The event could not be handled
    Failed(SubscriberError),
}

impl RefreshOutcome {
    /// Whether the message carrying this event should be completed.
    pub fn acknowledges(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Collapses overlapping full reloads into one.
///
/// Every request takes a ticket. A reload covers every ticket issued before
/// it started; a request whose ticket is already covered when it gets the
/// lock returns without reloading again.
#[derive(Default)]
struct ReloadGate {
    requested: AtomicU64,
    covered: Mutex<u64>,
}

impl ReloadGate {
    /// Returns `true` if this call performed the reload.
    async fn reload(&self, root: &dyn ConfigurationRoot) -> Result<bool> {
        let ticket = self.requested.fetch_add(1, Ordering::AcqRel) + 1;
        let mut covered = self.covered.lock().await;
        if *covered >= ticket {
            return Ok(false);
        }

        let covers = self.requested.load(Ordering::Acquire);
        root.reload().await?;
        *covered = covers;
        Ok(true)
    }
}

/// Routes classified events to the right refresh action.
///
/// - Vault object events trigger a full reload when the auto-update toggle is
///   on and a new version was created.
/// - Push notifications go to the refresher with the staleness window.
/// - Unrecognized events fail, so the message is not acknowledged.
pub struct RefreshDispatcher {
    classifier: EventClassifier,
    root: Arc<dyn ConfigurationRoot>,
    toggles: Arc<dyn FeatureToggles>,
    refresher: Option<Arc<dyn ConfigurationRefresher>>,
    max_staleness: Duration,
    reloads: ReloadGate,
    #[cfg(feature = "metrics")]
    metrics: Option<SubscriberMetrics>,
}

impl RefreshDispatcher {
    /// Create a dispatcher without a push-notification refresher.
    pub fn new(root: Arc<dyn ConfigurationRoot>, toggles: Arc<dyn FeatureToggles>) -> Self {
        Self {
            classifier: EventClassifier::new(),
            root,
            toggles,
            refresher: None,
            max_staleness: DEFAULT_MAX_STALENESS,
            reloads: ReloadGate::default(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Forward push notifications to this refresher.
    pub fn with_refresher(mut self, refresher: Arc<dyn ConfigurationRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Staleness window passed with each push notification.
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = max_staleness;
        self
    }

    /// Record reloads and push notifications.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: SubscriberMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Classify a raw body and dispatch it.
    pub async fn handle_body(&self, body: &[u8]) -> RefreshOutcome {
        let event = self.classifier.classify(body);
        self.dispatch(&event).await
    }

    /// Dispatch a classified event.
    pub async fn dispatch(&self, event: &ChangeEvent) -> RefreshOutcome {
        match event {
            ChangeEvent::VaultObjectChanged(event) => self.dispatch_vault(event).await,
            ChangeEvent::GenericPushNotification(notification) => {
                self.dispatch_push(notification).await
            }
            ChangeEvent::Unrecognized(reason) => {
                tracing::error!(reason = %reason, "Unknown message");
                RefreshOutcome::Failed(SubscriberError::UnrecognizedEvent(reason.clone()))
            }
        }
    }

    async fn dispatch_vault(&self, event: &VaultObjectEvent) -> RefreshOutcome {
        if !self.toggles.is_enabled(AUTO_UPDATE_SECRETS_TOGGLE).await {
            tracing::trace!(event_type = %event.event_type, "Not processing vault event");
            return RefreshOutcome::Skipped(SkipReason::ToggleDisabled);
        }

        if event.kind != VaultEventKind::NewVersionCreated {
            tracing::trace!(
                event_type = %event.event_type,
                subject = %event.subject,
                "vault event does not require a reload"
            );
            return RefreshOutcome::Skipped(SkipReason::NotActionable(event.kind));
        }

        tracing::trace!(
            subject = %event.subject,
            vault = %event.vault_name,
            object = %event.object_name,
            "Refreshing all configuration, triggered by vault object"
        );
        match self.reloads.reload(self.root.as_ref()).await {
            Ok(performed) => {
                #[cfg(feature = "metrics")]
                if performed {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_full_reload();
                    }
                }
                if !performed {
                    tracing::trace!("reload collapsed into a concurrent one");
                }
                RefreshOutcome::Applied
            }
            Err(e) => {
                tracing::error!(error = %e, subject = %event.subject, "full reload failed");
                RefreshOutcome::Failed(e)
            }
        }
    }

    async fn dispatch_push(&self, notification: &PushNotification) -> RefreshOutcome {
        let Some(refresher) = &self.refresher else {
            tracing::debug!(
                resource = %notification.resource_uri,
                "push notification ignored, no refresher configured"
            );
            return RefreshOutcome::Skipped(SkipReason::NoRefresher);
        };

        match refresher
            .process_push_notification(notification, self.max_staleness)
            .await
        {
            Ok(()) => {
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_push_notification();
                }
                RefreshOutcome::Applied
            }
            Err(e) => {
                tracing::error!(error = %e, resource = %notification.resource_uri, "push notification rejected");
                RefreshOutcome::Failed(e)
            }
        }
    }
}

#[async_trait]
impl MessageHandler for RefreshDispatcher {
    async fn handle(&self, message: &InboundMessage) -> Result<()> {
        match self.handle_body(&message.body).await {
            RefreshOutcome::Failed(e) => Err(e),
            RefreshOutcome::Applied | RefreshOutcome::Skipped(_) => Ok(()),
        }
    }
}
