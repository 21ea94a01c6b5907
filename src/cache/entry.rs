//! Persisted cache entries.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current wall clock in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A cached value with its freshness metadata.
///
/// An entry without a value is never fresh, whatever its timestamps say.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    /// Time of the last successful computation (epoch ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<u64>,
    /// Time after which the entry is considered expired (epoch ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
    /// Fingerprint of the code and options that produced the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

impl<T> Default for CacheEntry<T> {
    fn default() -> Self {
        Self {
            value: None,
            mtime: None,
            expires: None,
            integrity: None,
        }
    }
}

impl<T> CacheEntry<T> {
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// True when older than `ttl_ms` at `now`. Entries without `mtime` are
    /// treated as infinitely old.
    pub fn is_older_than(&self, ttl_ms: u64, now: u64) -> bool {
        now.saturating_sub(self.mtime.unwrap_or(0)) > ttl_ms
    }
}
