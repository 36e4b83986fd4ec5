//! In-process TTL cache.
//!
//! Entries carry only the instant they were written. Expiry is decided by
//! the reader: every `get` supplies its own TTL, so two readers may see the
//! same entry as fresh and stale. Expired entries are removed lazily by the
//! read that finds them.
//!
//! One lock guards the whole map and is held for the full duration of each
//! operation. A `get` followed by a `set` is not atomic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Errors raised by the cache itself.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache lock poisoned")]
    Poisoned,
}

/// Source of the current instant for TTL comparisons
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Monotonic system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    written_at: Instant,
}

/// Key/value cache with per-read expiry
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Value stored under `key` if it was written less than `ttl` ago.
    ///
    /// An expired entry is removed before returning `None`.
    pub fn get(&self, key: &str, ttl: Duration) -> Result<Option<V>, CacheError> {
        let mut entries = self.lock()?;
        let now = self.clock.now();

        let Some(entry) = entries.get(key) else {
            return Ok(None);
        };

        if now.saturating_duration_since(entry.written_at) < ttl {
            return Ok(Some(entry.value.clone()));
        }

        entries.remove(key);
        debug!(key = %key, "Expired cache entry evicted");
        Ok(None)
    }

    /// Store `value` under `key`, overwriting any previous value and timestamp.
    pub fn set(&self, key: impl Into<String>, value: V) -> Result<(), CacheError> {
        let mut entries = self.lock()?;
        let written_at = self.clock.now();
        entries.insert(key.into(), CacheEntry { value, written_at });
        Ok(())
    }

    /// Remove `key`. Returns whether an entry was present.
    pub fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.lock()?.remove(key).is_some())
    }

    /// Remove every entry. Returns how many were dropped.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let mut entries = self.lock()?;
        let count = entries.len();
        entries.clear();
        Ok(count)
    }

    /// Keys currently held, expired or not, in sorted order
    pub fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut keys: Vec<String> = self.lock()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, CacheEntry<V>>>, CacheError> {
        self.entries.lock().map_err(|_| CacheError::Poisoned)
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Clock that only moves when told to
#[cfg(test)]
pub(crate) struct ManualClock {
    now: Mutex<Instant>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}
