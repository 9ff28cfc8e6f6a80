//! Push notifications and the deadline-based refresher that consumes them.

use super::{ConfigurationRefresher, ConfigurationRoot, SyncTokens};
use crate::error::{Result, SubscriberError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A change notification from the configuration store's event feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotification {
    /// Consistency token the next read must be at least as fresh as
    pub sync_token: String,
    /// Event type, e.g. `Microsoft.AppConfiguration.KeyValueModified`
    pub event_type: String,
    /// URI of the changed key-value
    pub resource_uri: String,
}

impl PushNotification {
    /// Event type prefix of configuration store key-value events.
    pub const EVENT_TYPE_PREFIX: &'static str = "Microsoft.AppConfiguration.KeyValue";

    /// Build a notification, or `None` if any part is missing or the event
    /// is not a key-value event.
    pub fn new(
        sync_token: impl Into<String>,
        event_type: impl Into<String>,
        resource_uri: impl Into<String>,
    ) -> Option<Self> {
        let notification = Self {
            sync_token: sync_token.into(),
            event_type: event_type.into(),
            resource_uri: resource_uri.into(),
        };

        let valid = !notification.sync_token.trim().is_empty()
            && !notification.resource_uri.trim().is_empty()
            && notification.event_type.starts_with(Self::EVENT_TYPE_PREFIX);
        valid.then_some(notification)
    }
}

#[derive(Debug, Default)]
struct PushState {
    sync_token: Option<String>,
    dirty_at: Option<Instant>,
    received: u64,
}

/// Refresher that turns push notifications into a scheduled full reload.
///
/// Each notification marks the cache dirty at a random point within the
/// staleness window, so a fleet of instances does not reload in lockstep.
/// A later notification never postpones an earlier deadline. Sync tokens
/// are recorded in a [`SyncTokens`] set; share it with the store source so
/// the reload reads at least as fresh as the change that triggered it.
///
/// ```rust,no_run
/// use config_change_subscriber::refresh::PushRefresher;
/// use config_change_subscriber::core::LiveConfig;
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(config: LiveConfig<serde_json::Value>) {
/// let refresher = Arc::new(PushRefresher::new(Arc::new(config)));
/// let tokens = refresher.sync_tokens().clone(); // hand to RemoteStoreSource
/// let cancel = CancellationToken::new();
/// tokio::spawn(Arc::clone(&refresher).run(Duration::from_secs(1), cancel.clone()));
/// # }
/// ```
pub struct PushRefresher {
    root: Arc<dyn ConfigurationRoot>,
    tokens: SyncTokens,
    state: Mutex<PushState>,
}

impl PushRefresher {
    /// Create a refresher that reloads `root` when the cache goes dirty.
    pub fn new(root: Arc<dyn ConfigurationRoot>) -> Self {
        Self {
            root,
            tokens: SyncTokens::new(),
            state: Mutex::new(PushState::default()),
        }
    }

    /// Record sync tokens into an existing set instead of a private one.
    pub fn with_sync_tokens(mut self, tokens: SyncTokens) -> Self {
        self.tokens = tokens;
        self
    }

    /// Sync tokens collected from notifications.
    pub fn sync_tokens(&self) -> &SyncTokens {
        &self.tokens
    }

    /// Sync token of the most recent notification.
    pub fn sync_token(&self) -> Option<String> {
        self.state.lock().sync_token.clone()
    }

    /// When the cache is due to be treated as dirty, if a refresh is pending.
    pub fn dirty_at(&self) -> Option<Instant> {
        self.state.lock().dirty_at
    }

    /// Notifications processed so far.
    pub fn received(&self) -> u64 {
        self.state.lock().received
    }

    /// Reload if the dirty deadline has passed.
    ///
    /// Returns `true` if a reload ran. A failed reload stays pending.
    ///
    /// # Errors
    ///
    /// Returns the reload error.
    pub async fn refresh_if_due(&self) -> Result<bool> {
        let due = {
            let mut state = self.state.lock();
            let now = Instant::now();
            if state.dirty_at.is_some_and(|at| at <= now) {
                state.dirty_at.take()
            } else {
                None
            }
        };

        let Some(due) = due else {
            return Ok(false);
        };

        if let Err(e) = self.root.reload().await {
            let mut state = self.state.lock();
            state.dirty_at = Some(state.dirty_at.map_or(due, |at| at.min(due)));
            return Err(e);
        }

        tracing::debug!("push-triggered reload applied");
        Ok(true)
    }

    /// Poll for due refreshes until cancelled.
    pub async fn run(self: Arc<Self>, poll_interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_if_due().await {
                        tracing::warn!(error = %e, "push-triggered reload failed, will retry");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ConfigurationRefresher for PushRefresher {
    async fn process_push_notification(
        &self,
        notification: &PushNotification,
        max_staleness: Duration,
    ) -> Result<()> {
        if notification.sync_token.trim().is_empty() {
            return Err(SubscriberError::ReloadFailed(
                "push notification without sync token".to_string(),
            ));
        }

        if self.tokens.record(&notification.sync_token) == 0 {
            tracing::trace!(token = %notification.sync_token, "sync token not newer than known");
        }

        let window = u64::try_from(max_staleness.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(fastrand::u64(0..=window));
        let candidate = Instant::now() + delay;

        let mut state = self.state.lock();
        state.sync_token = Some(notification.sync_token.clone());
        state.received += 1;
        state.dirty_at = Some(match state.dirty_at {
            Some(existing) => existing.min(candidate),
            None => candidate,
        });

        tracing::trace!(
            event_type = %notification.event_type,
            resource = %notification.resource_uri,
            delay_ms = delay.as_millis() as u64,
            "cache scheduled dirty"
        );
        Ok(())
    }
}
