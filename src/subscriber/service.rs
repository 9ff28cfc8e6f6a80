//! The long-running change subscriber service.

use super::dispatcher::RefreshDispatcher;
use super::manager::SubscriptionManager;
use super::message_loop::MessageLoop;
use super::recovery::{ChannelHealth, RecoveryHandler};
use crate::broker::{BrokerClients, BrokerConnector, BrokerCredential, BrokerError, Subscription};
use crate::error::{Result, SubscriberError};
use crate::refresh::{ConfigurationRefresher, ConfigurationRoot, FeatureToggles, StaticToggles};
use crate::settings::{ChangeSubscriptionSettings, RuntimeSettings};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "metrics")]
use crate::metrics::SubscriberMetrics;

enum ServiceState {
    Created(mpsc::UnboundedReceiver<BrokerError>),
    Starting,
    Running(JoinHandle<()>),
    Stopped,
}

/// Keeps a durable subscription to the change topic and refreshes
/// configuration as notifications arrive.
///
/// # Examples
///
/// ```rust,no_run
/// use config_change_subscriber::prelude::*;
/// use config_change_subscriber::broker::InMemoryBroker;
/// use std::sync::Arc;
///
/// # async fn example(config: LiveConfig<serde_json::Value>) -> Result<()> {
/// let mut settings = ChangeSubscriptionSettings::new("config-changes", "orders-api");
/// settings.service_bus_namespace = Some("https://myns.servicebus.windows.net:443/".to_string());
/// let broker = InMemoryBroker::new().with_topic("config-changes");
///
/// let subscriber = ChangeSubscriber::builder(settings)
///     .connect(&broker, &RuntimeSettings::new(RuntimeEnvironment::Production))?
///     .with_configuration_root(Arc::new(config))
///     .build()?;
///
/// subscriber
///     .run_until(async {
///         let _ = tokio::signal::ctrl_c().await;
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct ChangeSubscriber {
    subscription: Subscription,
    manager: SubscriptionManager,
    recovery: RecoveryHandler,
    state: Mutex<ServiceState>,
    cancel: CancellationToken,
}

impl ChangeSubscriber {
    /// Start building a subscriber from its settings.
    pub fn builder(settings: ChangeSubscriptionSettings) -> ChangeSubscriberBuilder {
        ChangeSubscriberBuilder::new(settings)
    }

    /// Subscription this instance consumes.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Health of the subscription channel.
    pub fn health(&self) -> ChannelHealth {
        self.recovery.health()
    }

    /// Subscriptions re-established since start.
    pub fn recoveries(&self) -> u64 {
        self.recovery.recoveries()
    }

    /// Whether the subscriber is running.
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), ServiceState::Running(_))
    }

    /// Ensure the subscription, start receiving and start watching errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriber was already started, or if the
    /// subscription cannot be set up. A failed start can be retried.
    pub async fn start(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock(), ServiceState::Starting);
        let errors = match previous {
            ServiceState::Created(errors) => errors,
            other => {
                *self.state.lock() = other;
                return Err(SubscriberError::Lifecycle("subscriber already started"));
            }
        };

        if let Err(e) = self.recovery.start().await {
            tracing::error!(
                topic = %self.subscription.topic,
                subscription = %self.subscription.name,
                error = %e,
                "failed to set up change subscription"
            );
            *self.state.lock() = ServiceState::Created(errors);
            return Err(e);
        }

        let supervisor = tokio::spawn(supervise(
            self.recovery.clone(),
            errors,
            self.cancel.clone(),
        ));
        *self.state.lock() = ServiceState::Running(supervisor);

        tracing::info!(
            topic = %self.subscription.topic,
            subscription = %self.subscription.name,
            "Start"
        );
        Ok(())
    }

    /// Stop watching errors, drain in-flight messages and delete the
    /// subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriber is not running or the subscription
    /// cannot be deleted.
    pub async fn stop(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock(), ServiceState::Stopped);
        let supervisor = match previous {
            ServiceState::Running(supervisor) => supervisor,
            other => {
                *self.state.lock() = other;
                return Err(SubscriberError::Lifecycle("subscriber not running"));
            }
        };

        tracing::info!(subscription = %self.subscription.name, "Stopping");
        self.cancel.cancel();
        if let Err(e) = supervisor.await {
            tracing::warn!(error = %e, "error supervisor ended abnormally");
        }
        self.recovery.stop().await;

        self.manager
            .remove_subscription(&self.subscription.topic, &self.subscription.name)
            .await?;

        tracing::info!(subscription = %self.subscription.name, "Stopped");
        Ok(())
    }

    /// Run until `shutdown` completes, then stop.
    ///
    /// # Errors
    ///
    /// Returns a start or stop failure.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }
}

async fn supervise(
    recovery: RecoveryHandler,
    mut errors: mpsc::UnboundedReceiver<BrokerError>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            error = errors.recv() => match error {
                Some(error) => {
                    recovery.on_error(error);
                }
                None => break,
            },
        }
    }
}

/// Builder for a [`ChangeSubscriber`].
pub struct ChangeSubscriberBuilder {
    settings: ChangeSubscriptionSettings,
    instance: Option<String>,
    clients: Option<BrokerClients>,
    root: Option<Arc<dyn ConfigurationRoot>>,
    toggles: Option<Arc<dyn FeatureToggles>>,
    refresher: Option<Arc<dyn ConfigurationRefresher>>,
    #[cfg(feature = "metrics")]
    metrics: Option<SubscriberMetrics>,
}

impl ChangeSubscriberBuilder {
    /// Create a builder from settings.
    pub fn new(settings: ChangeSubscriptionSettings) -> Self {
        Self {
            settings,
            instance: None,
            clients: None,
            root: None,
            toggles: None,
            refresher: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Instance discriminator appended to the subscription prefix.
    /// Defaults to the host name.
    pub fn with_instance_name(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Use already connected broker clients.
    pub fn with_clients(mut self, clients: BrokerClients) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Resolve the credential for the runtime environment and connect.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment has no connection mode or the
    /// broker rejects the credential.
    pub fn connect(
        mut self,
        connector: &dyn BrokerConnector,
        runtime: &RuntimeSettings,
    ) -> Result<Self> {
        let credential = BrokerCredential::resolve(runtime, &self.settings)?;
        let endpoint = credential
            .endpoint()
            .unwrap_or_else(|| "unknown".to_string());
        tracing::debug!(environment = %runtime.environment, endpoint = %endpoint, "connecting to broker");
        self.clients = Some(connector.connect(&credential)?);
        Ok(self)
    }

    /// Configuration reloaded in full on new vault object versions. Required.
    pub fn with_configuration_root(mut self, root: Arc<dyn ConfigurationRoot>) -> Self {
        self.root = Some(root);
        self
    }

    /// Toggle provider. Defaults to every toggle off.
    pub fn with_feature_toggles(mut self, toggles: Arc<dyn FeatureToggles>) -> Self {
        self.toggles = Some(toggles);
        self
    }

    /// Refresher receiving push notifications. Without one, push
    /// notifications are acknowledged and ignored.
    pub fn with_refresher(mut self, refresher: Arc<dyn ConfigurationRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Record OpenTelemetry metrics.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: SubscriberMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the subscriber. Nothing touches the broker until `start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid, broker clients or the
    /// configuration root are missing, or the host name cannot be read.
    pub fn build(self) -> Result<ChangeSubscriber> {
        self.settings.check()?;

        let clients = self.clients.ok_or_else(|| {
            SubscriberError::Other("broker clients are required, call connect or with_clients".to_string())
        })?;
        let root = self
            .root
            .ok_or_else(|| SubscriberError::Other("a configuration root is required".to_string()))?;

        let name = match &self.instance {
            Some(instance) => self.settings.subscription_name(instance),
            None => self.settings.subscription_name_for_host()?,
        };
        let subscription = Subscription::new(
            self.settings.service_bus_topic.clone(),
            name,
            self.settings.idle_timeout(),
        );

        let toggles = self
            .toggles
            .unwrap_or_else(|| Arc::new(StaticToggles::new()));
        let mut dispatcher = RefreshDispatcher::new(root, toggles)
            .with_max_staleness(self.settings.max_staleness());
        if let Some(refresher) = self.refresher {
            dispatcher = dispatcher.with_refresher(refresher);
        }

        let manager = SubscriptionManager::new(Arc::clone(&clients.admin));
        let message_loop = MessageLoop::new(Arc::clone(&clients.messages), self.settings.concurrency());

        #[cfg(feature = "metrics")]
        let (dispatcher, message_loop) = match &self.metrics {
            Some(metrics) => (
                dispatcher.with_metrics(metrics.clone()),
                message_loop.with_metrics(metrics.clone()),
            ),
            None => (dispatcher, message_loop),
        };

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let recovery = RecoveryHandler::new(
            manager.clone(),
            message_loop,
            Arc::new(dispatcher),
            subscription.clone(),
            errors_tx,
        );

        #[cfg(feature = "metrics")]
        let recovery = match self.metrics {
            Some(metrics) => recovery.with_metrics(metrics),
            None => recovery,
        };

        Ok(ChangeSubscriber {
            subscription,
            manager,
            recovery,
            state: Mutex::new(ServiceState::Created(errors_rx)),
            cancel: CancellationToken::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::core::LiveConfig;

    const TOPIC: &str = "config-changes";

    fn builder(broker: &InMemoryBroker) -> ChangeSubscriberBuilder {
        ChangeSubscriber::builder(ChangeSubscriptionSettings::new(TOPIC, "orders-api"))
            .with_clients(BrokerClients {
                admin: Arc::new(broker.clone()),
                messages: Arc::new(broker.clone()),
            })
            .with_instance_name("host1")
            .with_configuration_root(Arc::new(LiveConfig::new(serde_json::Value::Null)))
    }

    #[test]
    fn test_build_requires_root() {
        let broker = InMemoryBroker::new();
        let result = ChangeSubscriber::builder(ChangeSubscriptionSettings::new(TOPIC, "orders-api"))
            .with_clients(BrokerClients {
                admin: Arc::new(broker.clone()),
                messages: Arc::new(broker),
            })
            .with_instance_name("host1")
            .build();
        assert!(matches!(result, Err(SubscriberError::Other(_))));
    }

    #[test]
    fn test_build_rejects_invalid_settings() {
        let broker = InMemoryBroker::new();
        let mut settings = ChangeSubscriptionSettings::new(TOPIC, "orders-api");
        settings.auto_delete_on_idle_in_hours = 0;
        let result = ChangeSubscriber::builder(settings)
            .with_clients(BrokerClients {
                admin: Arc::new(broker.clone()),
                messages: Arc::new(broker),
            })
            .build();
        assert!(matches!(result, Err(SubscriberError::ValidationError(_))));
    }

    #[test]
    fn test_connect_unconfigured_environment_fails() {
        let broker = InMemoryBroker::new();
        let result = ChangeSubscriber::builder(ChangeSubscriptionSettings::new(TOPIC, "orders-api"))
            .connect(&broker, &RuntimeSettings::new(crate::settings::RuntimeEnvironment::Test));
        assert!(matches!(result, Err(SubscriberError::EnvironmentNotConfigured(_))));
    }

    #[tokio::test]
    async fn test_subscription_named_after_instance() {
        let broker = InMemoryBroker::new().with_topic(TOPIC);
        let subscriber = builder(&broker).build().unwrap();
        assert_eq!(subscriber.subscription().name, "orders-api-host1");
        assert_eq!(
            subscriber.subscription().auto_delete_on_idle,
            std::time::Duration::from_secs(24 * 3600)
        );
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let broker = InMemoryBroker::new().with_topic(TOPIC);
        let subscriber = builder(&broker).build().unwrap();

        assert!(matches!(subscriber.stop().await, Err(SubscriberError::Lifecycle(_))));

        subscriber.start().await.unwrap();
        assert!(subscriber.is_running());
        assert!(matches!(subscriber.start().await, Err(SubscriberError::Lifecycle(_))));

        subscriber.stop().await.unwrap();
        assert!(!subscriber.is_running());
        assert_eq!(broker.subscription_count(TOPIC), 0);
    }

    #[tokio::test]
    async fn test_failed_start_is_retryable() {
        let broker = InMemoryBroker::new();
        let subscriber = builder(&broker).build().unwrap();

        assert!(matches!(
            subscriber.start().await,
            Err(SubscriberError::SubscriptionSetup { .. })
        ));

        broker.create_topic(TOPIC);
        subscriber.start().await.unwrap();
        subscriber.stop().await.unwrap();
    }
}
