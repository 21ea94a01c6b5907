//! Get-or-compute cache engine with single-flight and stale-while-revalidate.
//!
//! # State Machine (per key)
//! ```text
//! MISS → COMPUTING → FRESH → (STALE ⇄ REVALIDATING) → FRESH | ERROR
//! ```
//!
//! # Responsibilities
//! - Read entries from storage, treating malformed data as a miss
//! - Decide expiry from integrity, ttl and the validator
//! - Run at most one recomputation per key at a time
//! - Serve stale values immediately when SWR is enabled
//! - Persist validated results
//!
//! # Design Decisions
//! - The pending table is a `DashMap`; "check pending, else register" runs
//!   inside a single `entry()` call so it is atomic per key
//! - Recomputations are spawned on tokio and run to completion even if every
//!   caller goes away. There is no timeout and no cancellation: a hung compute
//!   hangs every caller attached to it
//! - Only compute failures reach callers; storage failures are reported
//!   through the `ErrorHook` and degrade to recomputing

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::entry::{now_ms, CacheEntry};
use crate::cache::hash::hash;
use crate::cache::storage::Storage;
use crate::cache::types::{CacheContext, CacheError, CacheResult, ErrorHook};
use crate::observability::metrics;

/// Options shared by cached functions and cached handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Name of the cached function, part of the storage key.
    pub name: String,
    /// Group the function belongs to, part of the storage key.
    pub group: String,
    /// Storage key prefix.
    pub base: String,
    /// Seconds a value stays fresh. 0 disables ttl expiry.
    pub max_age: u64,
    /// Seconds a stale value may still be served (advertised only).
    pub stale_max_age: Option<u64>,
    /// Serve stale values while recomputing in the background.
    pub swr: bool,
    /// Fingerprint of the code producing values. Defaults to a hash of the options.
    pub integrity: Option<String>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            name: "_".to_string(),
            group: "functions".to_string(),
            base: "/cache".to_string(),
            max_age: 1,
            stale_max_age: None,
            swr: true,
            integrity: None,
        }
    }
}

impl CacheOptions {
    fn fingerprint(&self) -> String {
        let material = format!(
            "{}|{}|{}|{}|{:?}|{}|{}",
            self.name,
            self.group,
            self.base,
            self.max_age,
            self.stale_max_age,
            self.swr,
            env!("CARGO_PKG_VERSION"),
        );
        hash(material)
    }
}

type Validator<T> = Arc<dyn Fn(&CacheEntry<T>) -> bool + Send + Sync>;
type PendingResult<T> = Result<CacheEntry<T>, CacheError>;
type Pending<T> = Shared<BoxFuture<'static, PendingResult<T>>>;

/// Removes a key from the pending table when the computation settles,
/// including when it panics.
struct PendingGuard<T: Clone> {
    pending: Arc<DashMap<String, Pending<T>>>,
    key: String,
}

impl<T: Clone> Drop for PendingGuard<T> {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

/// A cached async function keyed by string.
pub struct CachedFunction<T: Clone> {
    options: CacheOptions,
    integrity: String,
    storage: Arc<dyn Storage>,
    errors: Arc<dyn ErrorHook>,
    validate: Validator<T>,
    pending: Arc<DashMap<String, Pending<T>>>,
}

impl<T> CachedFunction<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(options: CacheOptions, storage: Arc<dyn Storage>, errors: Arc<dyn ErrorHook>) -> Self {
        let integrity = options
            .integrity
            .clone()
            .unwrap_or_else(|| options.fingerprint());
        Self {
            options,
            integrity,
            storage,
            errors,
            validate: Arc::new(|entry: &CacheEntry<T>| entry.value.is_some()),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Replace the validator. Invalid values are returned but never persisted.
    pub fn with_validator<F>(mut self, validate: F) -> Self
    where
        F: Fn(&CacheEntry<T>) -> bool + Send + Sync + 'static,
    {
        self.validate = Arc::new(validate);
        self
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn integrity(&self) -> &str {
        &self.integrity
    }

    /// Number of recomputations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Full storage key for a cache key.
    pub fn storage_key(&self, key: &str) -> String {
        let file = format!("{}.json", key);
        let joined = [
            self.options.base.as_str(),
            self.options.group.as_str(),
            self.options.name.as_str(),
            file.as_str(),
        ]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(":");
        match joined.strip_suffix(":/") {
            Some(prefix) => format!("{}:index", prefix),
            None => joined,
        }
    }

    /// Return the cached entry for `key`, computing it when missing or expired.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        compute: F,
        invalidate_now: bool,
        ctx: &CacheContext,
    ) -> CacheResult<CacheEntry<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let storage_key = self.storage_key(key);
        let mut entry = self.read_entry(&storage_key).await;

        let now = now_ms();
        let ttl_ms = self.options.max_age.saturating_mul(1000);
        if ttl_ms > 0 {
            entry.expires = Some(now + ttl_ms);
        }

        let valid = (self.validate)(&entry);
        let same_integrity = entry.integrity.as_deref() == Some(self.integrity.as_str());
        let expired = invalidate_now
            || !same_integrity
            || (ttl_ms > 0 && entry.is_older_than(ttl_ms, now))
            || !valid;
        // Only an entry that merely aged out may be served stale.
        let usable = entry.has_value() && valid && same_integrity && !invalidate_now;

        if !expired && entry.has_value() {
            tracing::trace!(key = %storage_key, "Cache hit");
            metrics::record_cache_lookup(&self.options.group, "hit");
            return Ok(entry);
        }

        let pending = self.pending_for(key, storage_key.clone(), compute);

        if self.options.swr && usable {
            tracing::debug!(key = %storage_key, "Serving stale entry while revalidating");
            metrics::record_cache_lookup(&self.options.group, "stale");
            self.revalidate_in_background(pending, storage_key, ctx);
            return Ok(entry);
        }

        if entry.has_value() {
            // Never hand a stale value to anyone while a decisive recompute runs.
            entry = CacheEntry::default();
        }
        metrics::record_cache_lookup(&self.options.group, "miss");
        let fresh = pending.await?;
        Ok(CacheEntry {
            expires: fresh.expires.or(entry.expires),
            ..fresh
        })
    }

    async fn read_entry(&self, storage_key: &str) -> CacheEntry<T> {
        match self.storage.get(storage_key).await {
            Ok(None) => CacheEntry::default(),
            Ok(Some(raw)) if raw.is_object() => match serde_json::from_value(raw) {
                Ok(entry) => entry,
                Err(e) => {
                    self.report_malformed(storage_key, e.to_string());
                    CacheEntry::default()
                }
            },
            Ok(Some(_)) => {
                self.report_malformed(storage_key, "stored value is not an object".to_string());
                CacheEntry::default()
            }
            Err(e) => {
                tracing::warn!(key = %storage_key, error = %e, "Cache read failed");
                metrics::record_storage_error("read");
                self.errors.report(&CacheError::Storage(e), &["cache"]);
                CacheEntry::default()
            }
        }
    }

    fn report_malformed(&self, storage_key: &str, reason: String) {
        let error = CacheError::Malformed {
            key: storage_key.to_string(),
            reason,
        };
        tracing::error!(error = %error, "Malformed cache entry");
        self.errors.report(&error, &["cache"]);
    }

    /// Attach to the in-flight computation for `key`, or start one.
    fn pending_for<F, Fut, E>(&self, key: &str, storage_key: String, compute: F) -> Pending<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.pending.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                tracing::debug!(key = %storage_key, "Joining in-flight computation");
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                let guard = PendingGuard {
                    pending: self.pending.clone(),
                    key: key.to_string(),
                };
                let computation = self.recompute(guard, storage_key, compute).boxed().shared();
                slot.insert(computation.clone());
                // Runs to completion regardless of who is still waiting.
                tokio::spawn(computation.clone().map(|_| ()));
                computation
            }
        }
    }

    fn recompute<F, Fut, E>(
        &self,
        guard: PendingGuard<T>,
        storage_key: String,
        compute: F,
    ) -> impl Future<Output = PendingResult<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let storage = self.storage.clone();
        let errors = self.errors.clone();
        let validate = self.validate.clone();
        let integrity = self.integrity.clone();
        let group = self.options.group.clone();
        let ttl_ms = self.options.max_age.saturating_mul(1000);
        let ttl_hint = (self.options.max_age > 0 && !self.options.swr)
            .then(|| Duration::from_secs(self.options.max_age));

        async move {
            tracing::debug!(key = %storage_key, "Recomputing cache entry");
            metrics::record_recompute(&group);

            let value = match compute().await {
                Ok(value) => value,
                Err(e) => {
                    drop(guard);
                    tracing::debug!(key = %storage_key, error = %e, "Cached computation failed");
                    return Err(CacheError::Compute(Arc::new(e)));
                }
            };

            let now = now_ms();
            let entry = CacheEntry {
                value: Some(value),
                mtime: Some(now),
                expires: (ttl_ms > 0).then(|| now + ttl_ms),
                integrity: Some(integrity),
            };

            if validate(&entry) {
                match serde_json::to_value(&entry) {
                    Ok(json) => {
                        if let Err(e) = storage.set(&storage_key, json, ttl_hint).await {
                            tracing::warn!(key = %storage_key, error = %e, "Cache write failed");
                            metrics::record_storage_error("write");
                            errors.report(&CacheError::Storage(e), &["cache"]);
                        }
                    }
                    Err(e) => {
                        let error = CacheError::Encode {
                            key: storage_key.clone(),
                            reason: e.to_string(),
                        };
                        tracing::error!(error = %error, "Cache entry not persisted");
                        errors.report(&error, &["cache"]);
                    }
                }
            } else {
                tracing::debug!(key = %storage_key, "Computed value failed validation, not persisted");
            }

            drop(guard);
            Ok(entry)
        }
    }

    fn revalidate_in_background(&self, pending: Pending<T>, storage_key: String, ctx: &CacheContext) {
        let errors = self.errors.clone();
        let task = async move {
            if let Err(e) = pending.await {
                tracing::error!(key = %storage_key, error = %e, "Background revalidation failed");
                errors.report(&e, &["cache", "swr"]);
            }
        }
        .boxed();

        match &ctx.wait_until {
            Some(wait_until) => wait_until.wait_until(task),
            None => {
                tokio::spawn(task);
            }
        }
    }
}
