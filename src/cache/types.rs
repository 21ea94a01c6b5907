//! Cache error definitions and side channels.

use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors raised by a storage backend.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Storage read failed for '{key}': {message}")]
    Read { key: String, message: String },

    #[error("Storage write failed for '{key}': {message}")]
    Write { key: String, message: String },

    #[error("Invalid storage key '{0}'")]
    InvalidKey(String),
}

/// Errors that can occur in the cache engine.
///
/// Only `Compute` is ever returned to a caller; every other variant is
/// absorbed and reported through an [`ErrorHook`].
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The stored value was not a cache entry.
    #[error("Malformed data read from cache at '{key}': {reason}")]
    Malformed { key: String, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Serializing a freshly computed entry failed.
    #[error("Failed to encode cache entry '{key}': {reason}")]
    Encode { key: String, reason: String },

    /// The wrapped computation failed.
    #[error("Cached computation failed: {0}")]
    Compute(Arc<dyn std::error::Error + Send + Sync>),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Receives every absorbed cache failure.
pub trait ErrorHook: Send + Sync + 'static {
    fn report(&self, error: &CacheError, tags: &[&str]);
}

/// Reports failures as structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorHook;

impl ErrorHook for TracingErrorHook {
    fn report(&self, error: &CacheError, tags: &[&str]) {
        tracing::error!(error = %error, tags = ?tags, "Cache error");
    }
}

/// Accepts work that must finish even after the response was sent.
pub trait WaitUntil: Send + Sync + 'static {
    fn wait_until(&self, task: BoxFuture<'static, ()>);
}

/// Request extension carrying the host's deferred-completion hook.
#[derive(Clone)]
pub struct WaitUntilHandle(pub Arc<dyn WaitUntil>);

/// Per-call context for cache lookups.
#[derive(Clone, Default)]
pub struct CacheContext {
    pub wait_until: Option<Arc<dyn WaitUntil>>,
}

impl CacheContext {
    pub fn with_wait_until(wait_until: Arc<dyn WaitUntil>) -> Self {
        Self {
            wait_until: Some(wait_until),
        }
    }
}

/// Collects background tasks so a host can await them before suspending.
#[derive(Default)]
pub struct DeferredTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DeferredTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks registered and not yet flushed.
    pub fn pending(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// Wait for every registered task, including ones registered while waiting.
    pub async fn flush(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = match self.handles.lock() {
                Ok(mut handles) => handles.drain(..).collect(),
                Err(_) => return,
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "Deferred task did not complete");
                }
            }
        }
    }
}

impl WaitUntil for DeferredTasks {
    fn wait_until(&self, task: BoxFuture<'static, ()>) {
        let handle = tokio::spawn(task);
        match self.handles.lock() {
            Ok(mut handles) => {
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            }
            Err(_) => tracing::warn!("Deferred task registry poisoned, task left detached"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = CacheError::Malformed {
            key: "k".into(),
            reason: "not an object".into(),
        };
        assert_eq!(
            err.to_string(),
            "Malformed data read from cache at 'k': not an object"
        );

        let err: CacheError = StorageError::InvalidKey("../x".into()).into();
        assert!(err.to_string().contains("../x"));
    }

    #[tokio::test]
    async fn test_deferred_tasks_flush() {
        let tasks = DeferredTasks::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        tasks.wait_until(
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.store(true, Ordering::SeqCst);
            }
            .boxed(),
        );
        tasks.flush().await;
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(tasks.pending(), 0);
    }
}
