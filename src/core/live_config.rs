//! Live configuration handle with lock-free reads and full reloads.

use crate::core::{ChangeListeners, ConfigLoader, ListenerHandle};
use crate::error::{Result, SubscriberError, ValidationError};
use crate::refresh::ConfigurationRoot;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Type alias for validator functions.
pub(crate) type Validator<T> =
    Arc<dyn Fn(&T) -> std::result::Result<(), ValidationError> + Send + Sync>;

/// Handle to the current configuration snapshot.
///
/// Reads are lock-free (`arc-swap`); a reload re-reads every source, validates
/// the result and swaps it in atomically, so readers see either the old or the
/// new snapshot, never a mix. Clones share the snapshot, loader and listeners.
///
/// This is the configuration root the subscriber reloads when a vault object
/// changes.
///
/// # Examples
///
/// ```rust,no_run
/// use config_change_subscriber::prelude::*;
/// use serde::Deserialize;
///
/// #[derive(Debug, Deserialize, Clone)]
/// struct ApiSettings {
///     greeting: String,
/// }
///
/// # async fn example() -> Result<()> {
/// let config = LiveConfig::builder()
///     .with_file("config/appsettings.yaml")
///     .with_env_overrides("API", "__")
///     .build::<ApiSettings>()
///     .await?;
///
/// println!("{}", config.get().greeting);
/// config.reload().await?;
/// # Ok(())
/// # }
/// ```
pub struct LiveConfig<T> {
    current: Arc<ArcSwap<T>>,
    loader: Option<Arc<ConfigLoader>>,
    validator: Option<Validator<T>>,
    listeners: ChangeListeners,
    generation: Arc<AtomicU64>,
}

impl<T> LiveConfig<T> {
    /// Create a handle around a fixed initial value, without sources.
    ///
    /// ```rust
    /// use config_change_subscriber::core::LiveConfig;
    ///
    /// let config = LiveConfig::new(42);
    /// assert_eq!(*config.get(), 42);
    /// ```
    pub fn new(initial: T) -> Self {
        Self {
            current: Arc::new(ArcSwap::new(Arc::new(initial))),
            loader: None,
            validator: None,
            listeners: ChangeListeners::new(),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn with_loader(
        initial: T,
        loader: ConfigLoader,
        validator: Option<Validator<T>>,
    ) -> Self {
        Self {
            current: Arc::new(ArcSwap::new(Arc::new(initial))),
            loader: Some(Arc::new(loader)),
            validator,
            listeners: ChangeListeners::new(),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current snapshot.
    pub fn get(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// Number of snapshots swapped in since creation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Re-read every source and swap in the result.
    ///
    /// If loading or validation fails the current snapshot is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The handle was created with [`LiveConfig::new`] (no sources)
    /// - A source cannot be read
    /// - Deserialization or validation fails
    pub async fn reload(&self) -> Result<()>
    where
        T: DeserializeOwned,
    {
        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| SubscriberError::Other("No loader available for reload".to_string()))?;

        let fresh: T = loader.load().await?;
        self.swap(fresh).await
    }

    /// Replace the snapshot with a value directly.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub async fn update(&self, value: T) -> Result<()> {
        self.swap(value).await
    }

    /// Register a callback invoked after each reload or update.
    pub async fn subscribe<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback).await
    }

    async fn swap(&self, value: T) -> Result<()> {
        if let Some(validator) = &self.validator {
            validator(&value).map_err(|e| SubscriberError::ValidationError(e.to_string()))?;
        }

        self.current.store(Arc::new(value));
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.listeners.notify_all().await;
        Ok(())
    }
}

impl<T> Clone for LiveConfig<T> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
            loader: self.loader.clone(),
            validator: self.validator.clone(),
            listeners: self.listeners.clone(),
            generation: Arc::clone(&self.generation),
        }
    }
}

#[async_trait]
impl<T> ConfigurationRoot for LiveConfig<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    async fn reload(&self) -> Result<()> {
        LiveConfig::reload(self).await
    }
}
