//! Subscriber metrics tracking using OpenTelemetry.

use opentelemetry::metrics::{Counter, Histogram, Meter};
use std::time::Instant;

/// Metrics collector for the message loop, dispatcher and recovery handler.
#[derive(Clone)]
pub struct SubscriberMetrics {
    messages_received: Counter<u64>,
    messages_completed: Counter<u64>,
    messages_abandoned: Counter<u64>,
    handler_duration: Histogram<f64>,
    full_reloads: Counter<u64>,
    push_notifications: Counter<u64>,
    transport_errors: Counter<u64>,
    recoveries: Counter<u64>,
}

impl SubscriberMetrics {
    /// Create a new metrics collector with the provided meter.
    pub fn new(meter: Meter) -> Self {
        let messages_received = meter
            .u64_counter("config_subscriber.messages.received")
            .with_description("Messages delivered to the handler")
            .build();

        let messages_completed = meter
            .u64_counter("config_subscriber.messages.completed")
            .with_description("Messages settled as processed")
            .build();

        let messages_abandoned = meter
            .u64_counter("config_subscriber.messages.abandoned")
            .with_description("Messages released for redelivery after a handler failure")
            .build();

        let handler_duration = meter
            .f64_histogram("config_subscriber.handler.duration")
            .with_description("Time spent classifying and dispatching a message in seconds")
            .with_unit("s")
            .build();

        let full_reloads = meter
            .u64_counter("config_subscriber.reloads")
            .with_description("Full configuration reloads triggered by vault events")
            .build();

        let push_notifications = meter
            .u64_counter("config_subscriber.push_notifications")
            .with_description("Push notifications forwarded to the refresher")
            .build();

        let transport_errors = meter
            .u64_counter("config_subscriber.transport.errors")
            .with_description("Channel-level errors reported by the broker")
            .build();

        let recoveries = meter
            .u64_counter("config_subscriber.recoveries")
            .with_description("Subscriptions re-established after being lost")
            .build();

        Self {
            messages_received,
            messages_completed,
            messages_abandoned,
            handler_duration,
            full_reloads,
            push_notifications,
            transport_errors,
            recoveries,
        }
    }

    /// Count a received message and start its handler timer.
    pub fn start_message(&self) -> Instant {
        self.messages_received.add(1, &[]);
        Instant::now()
    }

    /// Record a message that was handled and completed.
    pub fn record_completed(&self, start: Instant) {
        self.messages_completed.add(1, &[]);
        self.handler_duration.record(start.elapsed().as_secs_f64(), &[]);
    }

    /// Record a message that failed and was abandoned.
    pub fn record_abandoned(&self, start: Instant) {
        self.messages_abandoned.add(1, &[]);
        self.handler_duration.record(start.elapsed().as_secs_f64(), &[]);
    }

    /// Record a full configuration reload.
    pub fn record_full_reload(&self) {
        self.full_reloads.add(1, &[]);
    }

    /// Record a forwarded push notification.
    pub fn record_push_notification(&self) {
        self.push_notifications.add(1, &[]);
    }

    /// Record a channel-level transport error.
    pub fn record_transport_error(&self) {
        self.transport_errors.add(1, &[]);
    }

    /// Record a completed subscription recovery.
    pub fn record_recovery(&self) {
        self.recoveries.add(1, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::global;

    #[test]
    fn test_metrics_creation() {
        let meter = global::meter("test");
        let _metrics = SubscriberMetrics::new(meter);
    }

    #[test]
    fn test_message_lifecycle_recording() {
        let metrics = SubscriberMetrics::new(global::meter("test"));

        let timer = metrics.start_message();
        metrics.record_completed(timer);

        let timer = metrics.start_message();
        metrics.record_abandoned(timer);

        metrics.record_full_reload();
        metrics.record_push_notification();
        metrics.record_transport_error();
        metrics.record_recovery();
    }
}
