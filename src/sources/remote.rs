//! Remote configuration store source.

use super::ConfigSource;
use crate::error::{Result, SubscriberError};
use crate::refresh::{SYNC_TOKEN_HEADER, SyncTokens};
use async_trait::async_trait;
use reqwest::{Client, header::HeaderValue};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Pages followed per load before giving up on `@nextLink` chains.
const MAX_PAGES: usize = 64;

#[derive(Debug, Deserialize)]
struct KeyValuePage {
    #[serde(default)]
    items: Vec<KeyValueItem>,
    #[serde(rename = "@nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyValueItem {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

/// Key-value configuration store reached over HTTP.
///
/// Fetches `GET {endpoint}/kv?key={selector}[&label={label}]`, follows
/// `@nextLink` pages, and maps store keys such as `API:Settings:Greeting` to
/// the nested path `api.settings.greeting`. When the store is unreachable the
/// last successfully loaded snapshot is served instead, so a full reload never
/// wipes configuration because of a network blip.
///
/// With [`with_sync_tokens`](RemoteStoreSourceBuilder::with_sync_tokens) every
/// request carries the recorded `Sync-Token`s, and tokens returned by the
/// store are recorded back.
///
/// # Examples
///
/// ```rust,no_run
/// use config_change_subscriber::sources::RemoteStoreSource;
/// use std::time::Duration;
///
/// # fn example() -> config_change_subscriber::error::Result<()> {
/// let tokens = config_change_subscriber::refresh::SyncTokens::new();
/// let source = RemoteStoreSource::builder()
///     .with_endpoint("https://myconfig.azconfig.io")
///     .with_key_filter("API:*")
///     .with_label("Production")
///     .with_auth_token("token")
///     .with_timeout(Duration::from_secs(5))
///     .with_sync_tokens(tokens)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RemoteStoreSource {
    endpoint: String,
    key_filter: String,
    label: Option<String>,
    client: Client,
    auth_token: Option<String>,
    priority: i32,
    sync_tokens: Option<SyncTokens>,
    last_known_good: Arc<RwLock<Option<HashMap<String, config::Value>>>>,
}

impl RemoteStoreSource {
    /// Create a new builder for constructing a remote store source.
    pub fn builder() -> RemoteStoreSourceBuilder {
        RemoteStoreSourceBuilder::new()
    }

    async fn fetch(&self) -> Result<HashMap<String, config::Value>> {
        let mut values = HashMap::new();
        let mut url = format!("{}/kv", self.endpoint);
        let mut first = true;

        for _ in 0..MAX_PAGES {
            let mut request = self.client.get(&url);
            if first {
                request = request.query(&[("key", self.key_filter.as_str())]);
                if let Some(label) = &self.label {
                    request = request.query(&[("label", label.as_str())]);
                }
            }
            if let Some(token) = &self.auth_token {
                let header = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| SubscriberError::LoadError(format!("Invalid bearer token: {}", e)))?;
                request = request.header("Authorization", header);
            }
            if let Some(tokens) = self.sync_tokens.as_ref().and_then(SyncTokens::header_value) {
                request = request.header(SYNC_TOKEN_HEADER, tokens);
            }

            let response = request
                .send()
                .await
                .map_err(|e| SubscriberError::LoadError(format!("HTTP request failed: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                return Err(SubscriberError::LoadError(format!(
                    "HTTP request failed with status {}: {}",
                    status,
                    status.canonical_reason().unwrap_or("Unknown")
                )));
            }

            if let Some(tokens) = &self.sync_tokens {
                for returned in response.headers().get_all(SYNC_TOKEN_HEADER) {
                    if let Ok(raw) = returned.to_str() {
                        tokens.record(raw);
                    }
                }
            }

            let page: KeyValuePage = response.json().await.map_err(|e| {
                SubscriberError::DeserializationError(format!("Failed to parse key-values: {}", e))
            })?;

            for item in page.items {
                let value = match item.value {
                    Some(v) => config::Value::new(None, config::ValueKind::String(v)),
                    None => config::Value::new(None, config::ValueKind::Nil),
                };
                values.insert(store_key_to_path(&item.key), value);
            }

            match page.next_link {
                Some(next) => {
                    url = if next.starts_with("http") {
                        next
                    } else {
                        format!("{}{}", self.endpoint, next)
                    };
                    first = false;
                }
                None => return Ok(values),
            }
        }

        Err(SubscriberError::LoadError(format!(
            "Key-value listing exceeded {} pages",
            MAX_PAGES
        )))
    }
}

#[async_trait]
impl ConfigSource for RemoteStoreSource {
    async fn load(&self) -> Result<HashMap<String, config::Value>> {
        match self.fetch().await {
            Ok(values) => {
                if let Ok(mut cached) = self.last_known_good.write() {
                    *cached = Some(values.clone());
                }
                Ok(values)
            }
            Err(e) => {
                let cached = self
                    .last_known_good
                    .read()
                    .ok()
                    .and_then(|cached| cached.clone());
                match cached {
                    Some(values) => {
                        tracing::warn!(source = %self.name(), error = %e, "remote store unavailable, serving last known good snapshot");
                        Ok(values)
                    }
                    None => Err(e),
                }
            }
        }
    }

    fn name(&self) -> String {
        format!("remote:{}/kv?key={}", self.endpoint, self.key_filter)
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

/// Builder for constructing a `RemoteStoreSource`.
pub struct RemoteStoreSourceBuilder {
    endpoint: Option<String>,
    key_filter: String,
    label: Option<String>,
    auth_token: Option<String>,
    timeout: Duration,
    priority: i32,
    sync_tokens: Option<SyncTokens>,
}

impl RemoteStoreSourceBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            endpoint: None,
            key_filter: "*".to_string(),
            label: None,
            auth_token: None,
            timeout: Duration::from_secs(10),
            priority: 250,
            sync_tokens: None,
        }
    }

    /// Set the store endpoint, e.g. `https://myconfig.azconfig.io`.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    /// Select keys with a store filter such as `API:*`. Default is `*`.
    pub fn with_key_filter(mut self, filter: impl Into<String>) -> Self {
        self.key_filter = filter.into();
        self
    }

    /// Restrict to one label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set Bearer token authentication.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set the request timeout. Default is 10 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send and update these sync tokens on every read.
    pub fn with_sync_tokens(mut self, tokens: SyncTokens) -> Self {
        self.sync_tokens = Some(tokens);
        self
    }

    /// Set the priority for this source. Default is 250.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Build the remote store source.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is set or the HTTP client cannot be built.
    pub fn build(self) -> Result<RemoteStoreSource> {
        let endpoint = self.endpoint.ok_or_else(|| {
            SubscriberError::LoadError("Endpoint is required for RemoteStoreSource".to_string())
        })?;

        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| SubscriberError::LoadError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(RemoteStoreSource {
            endpoint,
            key_filter: self.key_filter,
            label: self.label,
            client,
            auth_token: self.auth_token,
            priority: self.priority,
            sync_tokens: self.sync_tokens,
            last_known_good: Arc::new(RwLock::new(None)),
        })
    }
}

impl Default for RemoteStoreSourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// `API:Settings:Greeting` -> `api.settings.greeting`
fn store_key_to_path(key: &str) -> String {
    key.split(':')
        .map(|segment| segment.trim().to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(".")
}
