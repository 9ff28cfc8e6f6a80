//! # config-change-subscriber
//!
//! Refresh a running service's configuration, feature flags and vault
//! secrets from change notifications, without a restart.
//!
//! ## Overview
//!
//! `config-change-subscriber` keeps one durable subscription per running
//! instance on a change-notification topic and reacts to what arrives:
//! - Secret and certificate "new version" events trigger a full reload of the
//!   live configuration (gated by the `AutoUpdateLatestVersionSecrets` toggle)
//! - Configuration store push notifications mark cached values dirty within a
//!   staleness window
//! - Anything else is left unacknowledged for redelivery
//!
//! A lost subscription is recreated in the background, and the subscription
//! is deleted again on graceful shutdown.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use config_change_subscriber::prelude::*;
//! use config_change_subscriber::broker::InMemoryBroker;
//! use serde::Deserialize;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Deserialize, Clone)]
//! struct AppConfig {
//!     greeting: String,
//! }
//!
//! # async fn example() -> Result<()> {
//! // Live configuration: lock-free reads, full reloads
//! let config = LiveConfig::builder()
//!     .with_file("config/appsettings.yaml")
//!     .with_env_overrides("APP", "__")
//!     .build::<AppConfig>()
//!     .await?;
//!
//! let settings = LiveConfig::builder()
//!     .with_file("config/subscriber.yaml")
//!     .build_validated::<ChangeSubscriptionSettings>()
//!     .await?;
//!
//! let broker = InMemoryBroker::new().with_topic("config-changes");
//! let subscriber = ChangeSubscriber::builder((*settings.get()).clone())
//!     .connect(&broker, &RuntimeSettings::from_env()?)?
//!     .with_configuration_root(Arc::new(config.clone()))
//!     .with_feature_toggles(Arc::new(StaticToggles::new().with(AUTO_UPDATE_SECRETS_TOGGLE, true)))
//!     .build()?;
//!
//! subscriber.start().await?;
//! println!("{}", config.get().greeting);
//! subscriber.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `validation` (default): [`core::Validate`] and validated builds
//! - `remote`: HTTP configuration store source
//! - `metrics`: OpenTelemetry counters for the message loop and recovery

#![warn(missing_docs, rust_2024_compatibility)]
#![deny(unsafe_code)]

pub mod broker;
pub mod core;
pub mod error;
pub mod refresh;
pub mod settings;
pub mod sources;
pub mod subscriber;

#[cfg(feature = "metrics")]
pub mod metrics;

/// Convenient re-exports for common usage patterns.
pub mod prelude {
    pub use crate::core::{LiveConfig, LiveConfigBuilder};
    pub use crate::error::{Result, SubscriberError, ValidationError};
    pub use crate::refresh::{
        AUTO_UPDATE_SECRETS_TOGGLE, ConfigurationRefresher, ConfigurationRoot, FeatureFlags,
        FeatureToggles, PushRefresher, StaticToggles,
    };
    pub use crate::settings::{ChangeSubscriptionSettings, RuntimeEnvironment, RuntimeSettings};
    pub use crate::subscriber::{ChangeSubscriber, RefreshOutcome};

    #[cfg(feature = "validation")]
    pub use crate::core::Validate;
}
