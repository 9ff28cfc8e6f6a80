//! Callbacks invoked after the live configuration changes.

use std::sync::Arc;
use tokio::sync::RwLock;

type Callback = Box<dyn Fn() + Send + Sync>;

struct ListenersInner {
    callbacks: Vec<(usize, Callback)>,
    next_id: usize,
}

/// Handle for a registered listener; dropping it unregisters the callback.
pub struct ListenerHandle {
    id: usize,
    inner: Arc<RwLock<ListenersInner>>,
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let id = self.id;
        let inner = Arc::clone(&self.inner);
        // Outside a runtime there is nobody left to notify anyway.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                inner.write().await.callbacks.retain(|(cb_id, _)| *cb_id != id);
            });
        }
    }
}

/// Registry of change listeners shared by all clones of a [`LiveConfig`](crate::core::LiveConfig).
///
/// Listeners run after every successful reload or update, in registration order.
#[derive(Clone)]
pub struct ChangeListeners {
    inner: Arc<RwLock<ListenersInner>>,
}

impl ChangeListeners {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ListenersInner {
                callbacks: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Register a callback.
    pub async fn subscribe<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut inner = self.inner.write().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.callbacks.push((id, Box::new(callback)));

        ListenerHandle {
            id,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Invoke every registered callback.
    pub async fn notify_all(&self) {
        let inner = self.inner.read().await;
        for (_, callback) in &inner.callbacks {
            callback();
        }
    }

    /// Number of registered callbacks.
    pub async fn len(&self) -> usize {
        self.inner.read().await.callbacks.len()
    }

    /// Whether no callbacks are registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for ChangeListeners {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_notify_reaches_all_listeners() {
        let listeners = ChangeListeners::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&counter);
        let _h1 = listeners
            .subscribe(move || {
                c1.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        let c2 = Arc::clone(&counter);
        let _h2 = listeners
            .subscribe(move || {
                c2.fetch_add(10, Ordering::SeqCst);
            })
            .await;

        listeners.notify_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_drop_handle_unsubscribes() {
        let listeners = ChangeListeners::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        let handle = listeners
            .subscribe(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(listeners.len().await, 1);

        drop(handle);
        tokio::time::sleep(Duration::from_millis(50)).await;

        listeners.notify_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(listeners.is_empty().await);
    }
}
