//! Backing store contract.
//!
//! The engine never locks anything itself: every cross-thread and
//! cross-process interaction is a single atomic call on a [`Store`].

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Which end of a sequence to push to or pop from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum End {
    #[default]
    Head,
    Tail,
}

/// Atomic operations required from the backing store.
///
/// Sequences, associative maps, sets and plain values live in separate
/// namespaces keyed by string. Implementations must be safe to share between
/// threads; a blocking `pop` must only block its calling thread.
pub trait Store: Send + Sync {
    // -- sequences --

    fn push(&self, list: &str, value: &str, end: End) -> Result<()>;

    /// Pop one value. `wait` of `None` (or zero) is non-blocking; otherwise
    /// block up to `wait` for a value to arrive.
    fn pop(&self, list: &str, end: End, wait: Option<Duration>) -> Result<Option<String>>;

    fn len(&self, list: &str) -> Result<usize>;

    /// Whole sequence, head first.
    fn range(&self, list: &str) -> Result<Vec<String>>;

    /// Remove every occurrence of `value`. Returns how many were removed.
    fn remove(&self, list: &str, value: &str) -> Result<usize>;

    /// Remove the occurrence of `value` nearest the head, if any.
    fn remove_first(&self, list: &str, value: &str) -> Result<bool>;

    /// Keep only the first `max_len` values from the head.
    fn trim(&self, list: &str, max_len: usize) -> Result<()>;

    // -- associative maps --

    fn map_get(&self, map: &str, field: &str) -> Result<Option<String>>;

    fn map_set(&self, map: &str, field: &str, value: &str) -> Result<()>;

    /// Insert only if `field` is absent. Returns whether it was created.
    fn map_set_new(&self, map: &str, field: &str, value: &str) -> Result<bool>;

    fn map_delete(&self, map: &str, field: &str) -> Result<bool>;

    fn map_exists(&self, map: &str, field: &str) -> Result<bool>;

    fn map_keys(&self, map: &str) -> Result<Vec<String>>;

    /// Get-then-delete in one step.
    fn map_take(&self, map: &str, field: &str) -> Result<Option<String>>;

    // -- sets --

    fn set_add(&self, set: &str, member: &str) -> Result<bool>;

    fn set_remove(&self, set: &str, member: &str) -> Result<bool>;

    fn set_members(&self, set: &str) -> Result<Vec<String>>;

    // -- plain values --

    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn delete(&self, key: &str) -> Result<bool>;

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Normalize a wait so that zero means non-blocking everywhere.
pub(crate) fn effective_wait(wait: Option<Duration>) -> Option<Duration> {
    wait.filter(|d| !d.is_zero())
}

/// Open the store a URL names: `memory://` for an in-process store,
/// `redis://` (or `rediss://`) with the `redis` feature.
pub fn open(url: &str) -> Result<Arc<dyn Store>> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryStore::new()));
    }
    #[cfg(feature = "redis")]
    {
        if url.starts_with("redis://") || url.starts_with("rediss://") {
            let store = RedisStore::open(url)?;
            store.ping()?;
            return Ok(Arc::new(store));
        }
    }
    let scheme = url.split("://").next().unwrap_or(url);
    Err(Error::Config(format!("unsupported store scheme {scheme:?}")))
}
