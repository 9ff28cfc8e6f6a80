//! End-to-end subscriber scenarios against the in-memory broker.

use async_trait::async_trait;
use config_change_subscriber::broker::{
    BrokerClients, BrokerError, InMemoryBroker, SubscriptionAdmin,
};
use config_change_subscriber::prelude::*;
use config_change_subscriber::subscriber::{ChannelHealth, SubscriptionManager};
use serde::Deserialize;
use serde_json::json;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

const TOPIC: &str = "config-changes";
const SUBSCRIPTION: &str = "orders-api-host1";

#[derive(Default)]
struct CountingRoot {
    reloads: AtomicUsize,
}

#[async_trait]
impl ConfigurationRoot for CountingRoot {
    async fn reload(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn clients(broker: &InMemoryBroker) -> BrokerClients {
    BrokerClients {
        admin: Arc::new(broker.clone()),
        messages: Arc::new(broker.clone()),
    }
}

fn settings() -> ChangeSubscriptionSettings {
    ChangeSubscriptionSettings::new(TOPIC, "orders-api")
}

fn subscriber(
    broker: &InMemoryBroker,
    root: Arc<dyn ConfigurationRoot>,
    toggles: StaticToggles,
) -> ChangeSubscriber {
    ChangeSubscriber::builder(settings())
        .with_clients(clients(broker))
        .with_instance_name("host1")
        .with_configuration_root(root)
        .with_feature_toggles(Arc::new(toggles))
        .build()
        .unwrap()
}

fn secret_event(event_type: &str) -> String {
    json!({
        "id": "8d1f2a",
        "eventType": event_type,
        "subject": "db-pass",
        "data": {
            "Id": "https://kv-prod.vault.azure.net/secrets/db-pass/2",
            "ObjectType": "Secret",
            "VaultName": "kv-prod",
            "ObjectName": "db-pass"
        }
    })
    .to_string()
}

fn push_event(token: &str) -> String {
    json!({
        "eventType": "Microsoft.AppConfiguration.KeyValueModified",
        "subject": "https://store.azconfig.io/kv/Greeting",
        "data": { "key": "Greeting", "syncToken": token }
    })
    .to_string()
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn settled(broker: &InMemoryBroker) -> bool {
    broker.backlog_len(TOPIC, SUBSCRIPTION) == 0 && broker.locked_len(TOPIC, SUBSCRIPTION) == 0
}

#[tokio::test]
async fn test_new_secret_version_reloads_live_config() {
    #[derive(Debug, Deserialize, Clone)]
    struct AppSettings {
        greeting: String,
    }

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("appsettings.yaml");
    fs::write(&path, "greeting: hello\n").unwrap();

    let config = LiveConfig::builder()
        .with_file(&path)
        .build::<AppSettings>()
        .await
        .unwrap();

    let broker = InMemoryBroker::new().with_topic(TOPIC);
    let toggles = StaticToggles::new().with(AUTO_UPDATE_SECRETS_TOGGLE, true);
    let subscriber = subscriber(&broker, Arc::new(config.clone()), toggles);
    subscriber.start().await.unwrap();

    fs::write(&path, "greeting: rotated\n").unwrap();
    broker
        .publish(TOPIC, secret_event("Microsoft.KeyVault.SecretNewVersionCreated"))
        .unwrap();

    assert!(eventually(|| config.get().greeting == "rotated").await);
    assert!(eventually(|| settled(&broker)).await);
    assert_eq!(broker.dead_letter_len(TOPIC, SUBSCRIPTION), 0);

    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn test_toggle_disabled_acknowledges_without_reload() {
    let broker = InMemoryBroker::new().with_topic(TOPIC);
    let root = Arc::new(CountingRoot::default());
    let subscriber = subscriber(&broker, root.clone(), StaticToggles::new());
    subscriber.start().await.unwrap();

    broker
        .publish(TOPIC, secret_event("Microsoft.KeyVault.SecretNewVersionCreated"))
        .unwrap();

    assert!(eventually(|| settled(&broker)).await);
    assert_eq!(broker.dead_letter_len(TOPIC, SUBSCRIPTION), 0);
    assert_eq!(root.reloads.load(Ordering::SeqCst), 0);

    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn test_toggle_flip_takes_effect_without_restart() {
    let broker = InMemoryBroker::new().with_topic(TOPIC);
    let root = Arc::new(CountingRoot::default());
    let toggles = StaticToggles::new();
    let subscriber = subscriber(&broker, root.clone(), toggles.clone());
    subscriber.start().await.unwrap();

    broker
        .publish(TOPIC, secret_event("Microsoft.KeyVault.SecretNewVersionCreated"))
        .unwrap();
    assert!(eventually(|| settled(&broker)).await);
    assert_eq!(root.reloads.load(Ordering::SeqCst), 0);

    toggles.set(AUTO_UPDATE_SECRETS_TOGGLE, true);
    broker
        .publish(TOPIC, secret_event("Microsoft.KeyVault.SecretNewVersionCreated"))
        .unwrap();
    assert!(eventually(|| root.reloads.load(Ordering::SeqCst) == 1).await);

    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn test_unrecognized_message_never_acknowledged() {
    let broker = InMemoryBroker::new()
        .with_topic(TOPIC)
        .with_max_delivery_count(4);
    let root = Arc::new(CountingRoot::default());
    let toggles = StaticToggles::new().with(AUTO_UPDATE_SECRETS_TOGGLE, true);
    let subscriber = subscriber(&broker, root.clone(), toggles);
    subscriber.start().await.unwrap();

    broker
        .publish(TOPIC, r#"{"eventType":"Contoso.Orders.Created","subject":"o-1","data":{}}"#)
        .unwrap();

    assert!(eventually(|| broker.dead_letter_len(TOPIC, SUBSCRIPTION) == 1).await);
    assert_eq!(root.reloads.load(Ordering::SeqCst), 0);

    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn test_push_notifications_reach_refresher() {
    let broker = InMemoryBroker::new().with_topic(TOPIC);
    let root = Arc::new(CountingRoot::default());
    let refresher = Arc::new(PushRefresher::new(root.clone()));

    let mut settings = settings();
    settings.max_delay_before_cache_is_marked_dirty_in_seconds = Some(0);
    let subscriber = ChangeSubscriber::builder(settings)
        .with_clients(clients(&broker))
        .with_instance_name("host1")
        .with_configuration_root(root.clone())
        .with_refresher(refresher.clone())
        .build()
        .unwrap();
    subscriber.start().await.unwrap();

    broker.publish(TOPIC, push_event("tok;sn=1")).unwrap();
    broker.publish(TOPIC, push_event("tok;sn=2")).unwrap();

    assert!(eventually(|| refresher.received() == 2).await);
    assert!(eventually(|| settled(&broker)).await);
    assert!(refresher.sync_token().is_some());

    assert!(refresher.refresh_if_due().await.unwrap());
    assert_eq!(root.reloads.load(Ordering::SeqCst), 1);

    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn test_deleted_subscription_recreated_once_and_resumes() {
    let broker = InMemoryBroker::new().with_topic(TOPIC);
    let root = Arc::new(CountingRoot::default());
    let toggles = StaticToggles::new().with(AUTO_UPDATE_SECRETS_TOGGLE, true);
    let subscriber = subscriber(&broker, root.clone(), toggles);
    subscriber.start().await.unwrap();
    assert_eq!(broker.create_calls(), 1);

    // Deleting under an attached receiver reports the entity-not-found error.
    broker.delete_subscription(TOPIC, SUBSCRIPTION).await.unwrap();

    assert!(eventually(|| subscriber.recoveries() == 1).await);
    assert!(eventually(|| subscriber.health() == ChannelHealth::Healthy).await);
    assert_eq!(broker.create_calls(), 2);
    assert_eq!(broker.subscription_count(TOPIC), 1);
    assert!(broker.is_attached(TOPIC, SUBSCRIPTION));

    broker
        .publish(TOPIC, secret_event("Microsoft.KeyVault.SecretNewVersionCreated"))
        .unwrap();
    assert!(eventually(|| root.reloads.load(Ordering::SeqCst) == 1).await);

    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn test_unrelated_error_leaves_subscription_untouched() {
    let broker = InMemoryBroker::new().with_topic(TOPIC);
    let subscriber = subscriber(
        &broker,
        Arc::new(CountingRoot::default()),
        StaticToggles::new(),
    );
    subscriber.start().await.unwrap();

    assert!(broker.inject_error(
        TOPIC,
        SUBSCRIPTION,
        BrokerError::Transport("The connection was inactive for more than the allowed period".into())
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(subscriber.recoveries(), 0);
    assert_eq!(subscriber.health(), ChannelHealth::Healthy);
    assert_eq!(broker.create_calls(), 1);
    assert_eq!(broker.open_calls(), 1);
    assert!(broker.is_attached(TOPIC, SUBSCRIPTION));

    subscriber.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_removes_subscription() {
    let broker = InMemoryBroker::new().with_topic(TOPIC);
    let subscriber = subscriber(
        &broker,
        Arc::new(CountingRoot::default()),
        StaticToggles::new(),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let watcher = broker.clone();
    let trigger = tokio::spawn(async move {
        assert!(eventually(|| watcher.subscription_count(TOPIC) == 1).await);
        let _ = shutdown_tx.send(());
    });

    subscriber
        .run_until(async {
            let _ = shutdown_rx.await;
        })
        .await
        .unwrap();
    trigger.await.unwrap();

    assert_eq!(broker.subscription_count(TOPIC), 0);
    assert_eq!(broker.delete_calls(), 1);
}

#[tokio::test]
async fn test_missing_topic_fails_startup() {
    let broker = InMemoryBroker::new();
    let subscriber = subscriber(
        &broker,
        Arc::new(CountingRoot::default()),
        StaticToggles::new(),
    );

    let err = subscriber.start().await.unwrap_err();
    assert!(matches!(err, SubscriberError::SubscriptionSetup { .. }));
    assert!(!subscriber.is_running());
}

#[tokio::test]
async fn test_ensure_and_remove_are_idempotent() {
    let broker = InMemoryBroker::new().with_topic(TOPIC);
    let manager = SubscriptionManager::new(Arc::new(broker.clone()));
    let idle = Duration::from_secs(3600);

    manager.ensure_subscription(TOPIC, SUBSCRIPTION, idle).await.unwrap();
    manager.ensure_subscription(TOPIC, SUBSCRIPTION, idle).await.unwrap();
    assert_eq!(broker.subscription_count(TOPIC), 1);
    assert!(broker.subscription_exists(TOPIC, SUBSCRIPTION).await.unwrap());

    manager.remove_subscription(TOPIC, SUBSCRIPTION).await.unwrap();
    manager.remove_subscription(TOPIC, SUBSCRIPTION).await.unwrap();
    assert_eq!(broker.subscription_count(TOPIC), 0);
}
