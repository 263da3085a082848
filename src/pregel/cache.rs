//! Task-level write caching.
//!
//! A node with a [`CachePolicy`] gets its writes memoized under a key
//! derived from its name and input: on a hit the cached writes replay
//! without executing the bound computation.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};
use serde_json::Value;

use crate::types::ChannelWrite;

/// Derives a cache key from a task input.
pub type CacheKeyFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Cache configuration for one node.
#[derive(Clone, Default)]
pub struct CachePolicy {
    /// Entry lifetime; `None` caches forever.
    pub ttl: Option<Duration>,
    /// Custom key derivation; defaults to a hash of the serialized input.
    pub key_fn: Option<CacheKeyFn>,
}

impl CachePolicy {
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            key_fn: None,
        }
    }

    #[must_use]
    pub fn with_key_fn(mut self, key_fn: CacheKeyFn) -> Self {
        self.key_fn = Some(key_fn);
        self
    }

    /// The cache key for `input`.
    #[must_use]
    pub fn key_for(&self, input: &Value) -> String {
        match &self.key_fn {
            Some(key_fn) => key_fn(input),
            None => {
                let serialized = input.to_string();
                let mut hasher = FxHasher::default();
                serialized.hash(&mut hasher);
                format!("{:016x}", hasher.finish())
            }
        }
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("ttl", &self.ttl)
            .field("custom_key", &self.key_fn.is_some())
            .finish()
    }
}

/// Storage backend for cached task writes. Namespaces are node names, so
/// clearing a node's cache never touches its neighbors.
pub trait CacheStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Option<Vec<ChannelWrite>>;
    fn put(&self, namespace: &str, key: &str, writes: Vec<ChannelWrite>, ttl: Option<Duration>);
    /// Clear the given namespaces, or everything when `None`.
    fn clear(&self, namespaces: Option<&[String]>);
}

struct CacheEntry {
    writes: Vec<ChannelWrite>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Process-local cache store with lazy TTL expiry.
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<FxHashMap<(String, String), CacheEntry>>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for InMemoryCache {
    fn get(&self, namespace: &str, key: &str) -> Option<Vec<ChannelWrite>> {
        let lookup = (namespace.to_string(), key.to_string());
        {
            let entries = self.entries.read();
            match entries.get(&lookup) {
                Some(entry) if !entry.is_expired() => return Some(entry.writes.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.entries.write().remove(&lookup);
        None
    }

    fn put(&self, namespace: &str, key: &str, writes: Vec<ChannelWrite>, ttl: Option<Duration>) {
        let entry = CacheEntry {
            writes,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries
            .write()
            .insert((namespace.to_string(), key.to_string()), entry);
    }

    fn clear(&self, namespaces: Option<&[String]>) {
        let mut entries = self.entries.write();
        match namespaces {
            Some(namespaces) => {
                entries.retain(|(ns, _), _| !namespaces.iter().any(|n| n == ns));
            }
            None => entries.clear(),
        }
    }
}
