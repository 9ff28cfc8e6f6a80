//! Built-in metrics for the change subscriber.
//!
//! Provides OpenTelemetry metrics tracking:
//! - Messages received, completed and abandoned
//! - Handler duration
//! - Full reloads and push notifications
//! - Transport errors and subscription recoveries
//!
//! # Examples
//!
//! ```rust,no_run
//! use config_change_subscriber::metrics::SubscriberMetrics;
//! use opentelemetry::global;
//!
//! let metrics = SubscriberMetrics::new(global::meter("config-change-subscriber"));
//! let timer = metrics.start_message();
//! // ... handle the message ...
//! metrics.record_completed(timer);
//! ```

mod subscriber_metrics;

pub use subscriber_metrics::SubscriberMetrics;
