//! Refresh collaborators driven by change notifications.
//!
//! The dispatcher never owns configuration; it talks to three injected
//! collaborators:
//! - [`ConfigurationRoot`]: full, unconditional reload
//! - [`ConfigurationRefresher`]: push-notification entry point of a cache-based refresher
//! - [`FeatureToggles`]: named on/off switches

mod push;
mod sync_token;
mod toggles;

pub use push::{PushNotification, PushRefresher};
pub use sync_token::{SYNC_TOKEN_HEADER, SyncTokens};
pub use toggles::{FeatureFlags, StaticToggles};

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Toggle gating the full reload on vault object changes.
pub const AUTO_UPDATE_SECRETS_TOGGLE: &str = "AutoUpdateLatestVersionSecrets";

/// A configuration surface that can be re-read in full.
///
/// Implementations must tolerate concurrent calls; the dispatcher collapses
/// overlapping requests but does not serialize across dispatchers.
#[async_trait]
pub trait ConfigurationRoot: Send + Sync {
    /// Re-read every source and replace the current configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the new configuration cannot be loaded; the old
    /// one stays in effect.
    async fn reload(&self) -> Result<()>;
}

/// Push-notification entry point of a cache-based configuration refresher.
#[async_trait]
pub trait ConfigurationRefresher: Send + Sync {
    /// Mark cached configuration dirty no later than `max_staleness` from now.
    ///
    /// Calling this twice with the same notification is harmless: the
    /// deadline can only move closer.
    ///
    /// # Errors
    ///
    /// Returns an error if the notification is rejected.
    async fn process_push_notification(
        &self,
        notification: &PushNotification,
        max_staleness: Duration,
    ) -> Result<()>;
}

/// Named feature switches.
#[async_trait]
pub trait FeatureToggles: Send + Sync {
    /// Whether the named feature is on. Unknown names are off.
    async fn is_enabled(&self, name: &str) -> bool;
}
