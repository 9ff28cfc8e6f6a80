//! Runs the subscriber against the in-memory broker and publishes a few
//! notifications.
//!
//! ```text
//! RUST_LOG=config_change_subscriber=trace cargo run --example in_memory_subscriber
//! ```

use config_change_subscriber::broker::InMemoryBroker;
use config_change_subscriber::prelude::*;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize, Clone)]
struct AppSettings {
    greeting: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dir = std::env::temp_dir().join("config-change-subscriber-demo");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("appsettings.yaml");
    std::fs::write(&path, "greeting: hello\n")?;

    let config = LiveConfig::builder()
        .with_file(&path)
        .build::<AppSettings>()
        .await?;
    let _listener = config
        .subscribe(|| tracing::info!("configuration reloaded"))
        .await;

    let mut settings = ChangeSubscriptionSettings::new("config-changes", "demo");
    settings.service_bus_connection_string = Some(
        "Endpoint=sb://demo.servicebus.windows.net/;SharedAccessKeyName=listen;SharedAccessKey=secret"
            .to_string(),
    );
    settings.max_delay_before_cache_is_marked_dirty_in_seconds = Some(1);

    let broker = InMemoryBroker::new().with_topic("config-changes");
    let refresher = Arc::new(PushRefresher::new(Arc::new(config.clone())));
    let cancel = CancellationToken::new();
    let polling = tokio::spawn(
        Arc::clone(&refresher).run(Duration::from_millis(200), cancel.clone()),
    );

    let subscriber = ChangeSubscriber::builder(settings)
        .connect(&broker, &RuntimeSettings::new(RuntimeEnvironment::Development))?
        .with_configuration_root(Arc::new(config.clone()))
        .with_feature_toggles(Arc::new(
            StaticToggles::new().with(AUTO_UPDATE_SECRETS_TOGGLE, true),
        ))
        .with_refresher(refresher)
        .build()?;
    subscriber.start().await?;

    std::fs::write(&path, "greeting: rotated secret\n")?;
    broker.publish(
        "config-changes",
        r#"{"eventType":"Microsoft.KeyVault.SecretNewVersionCreated","subject":"db-pass",
            "data":{"ObjectType":"Secret","VaultName":"kv-demo","ObjectName":"db-pass"}}"#,
    )?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    tracing::info!(greeting = %config.get().greeting, "after vault event");

    std::fs::write(&path, "greeting: pushed value\n")?;
    broker.publish(
        "config-changes",
        r#"{"eventType":"Microsoft.AppConfiguration.KeyValueModified",
            "subject":"https://demo.azconfig.io/kv/greeting","data":{"syncToken":"demo;sn=1"}}"#,
    )?;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    tracing::info!(greeting = %config.get().greeting, "after push notification");

    broker.publish("config-changes", r#"{"hello":"world"}"#)?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    tracing::info!(
        dead_lettered = broker.dead_letter_len("config-changes", subscriber.subscription().name.as_str()),
        "after unrecognized message"
    );

    subscriber.stop().await?;
    cancel.cancel();
    let _ = polling.await;
    Ok(())
}
