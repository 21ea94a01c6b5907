//! Key-value storage backends for cache entries.
//!
//! # Responsibilities
//! - Define the narrow get/set contract the cache engine depends on
//! - Provide an in-memory backend with TTL support
//! - Provide a filesystem backend that persists JSON documents
//!
//! # Design Decisions
//! - Values are `serde_json::Value`; the engine owns the entry schema
//! - Keys are `:`-separated; the filesystem backend maps `:` to directories
//! - Backends report errors; the engine decides they are non-fatal

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use crate::cache::types::StorageError;

pub type StorageResult<T> = Result<T, StorageError>;

/// Key-value store contract used by the cache engine.
pub trait Storage: Send + Sync + 'static {
    /// Read a value. `Ok(None)` when the key does not exist.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<Value>>>;

    /// Write a value. `ttl` is a hint; backends without expiry ignore it.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Value,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, StorageResult<()>>;
}

#[derive(Debug, Clone)]
struct MemoryItem {
    value: Value,
    expires_at: Option<Instant>,
}

impl MemoryItem {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Thread-safe in-process storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    items: Arc<DashMap<String, MemoryItem>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.items.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Write without going through the async contract (tests, warm-up).
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.items.insert(
            key.into(),
            MemoryItem {
                value,
                expires_at: None,
            },
        );
    }

    fn read(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        if let Some(item) = self.items.get(key) {
            if !item.is_expired(now) {
                return Some(item.value.clone());
            }
        }
        // Re-checked under the shard lock so a concurrent set is never dropped.
        self.items.remove_if(key, |_, item| item.is_expired(now));
        None
    }
}

impl Storage for MemoryStorage {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<Value>>> {
        let value = self.read(key);
        async move { Ok(value) }.boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Value,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, StorageResult<()>> {
        let item = MemoryItem {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.items.insert(key.to_string(), item);
        async move { Ok(()) }.boxed()
    }
}

/// Stores each key as a JSON file below a base directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    base: PathBuf,
}

impl FsStorage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Map `a:b:c.json` to `<base>/a/b/c.json`, rejecting traversal.
    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        let relative: PathBuf = key
            .split(':')
            .flat_map(|part| part.split('/'))
            .filter(|part| !part.is_empty())
            .collect();
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || relative.as_os_str().is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.base.join(relative))
    }
}

impl Storage for FsStorage {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<Value>>> {
        async move {
            let path = self.path_for(key)?;
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => {
                    return Err(StorageError::Read {
                        key: key.to_string(),
                        message: e.to_string(),
                    })
                }
            };
            // Non-JSON content is handed back as a string for the caller to judge.
            Ok(Some(serde_json::from_str(&raw).unwrap_or(Value::String(raw))))
        }
        .boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Value,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, StorageResult<()>> {
        async move {
            let path = self.path_for(key)?;
            if ttl.is_some() {
                tracing::trace!(key = %key, "Filesystem storage ignores ttl hint");
            }
            let write_err = |e: std::io::Error| StorageError::Write {
                key: key.to_string(),
                message: e.to_string(),
            };
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
            }
            let body = serde_json::to_vec(&value).map_err(|e| StorageError::Write {
                key: key.to_string(),
                message: e.to_string(),
            })?;
            tokio::fs::write(&path, body).await.map_err(write_err)?;
            Ok(())
        }
        .boxed()
    }
}
