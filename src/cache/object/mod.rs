//! Object cache adapter.
//!
//! A uniform get/set/delete/flush surface over the configured in-memory
//! backend. Backends are compiled in through the `redis-backend` and
//! `memcached-backend` features; [`BackendRegistry`] reports which ones
//! this build can use.

mod registry;

#[cfg(feature = "memcached-backend")]
mod memcached;
#[cfg(feature = "redis-backend")]
mod redis_cache;

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::config::InMemoryCache;
use super::lock::{rw_read, rw_write};

#[cfg(feature = "memcached-backend")]
pub use memcached::{MemcacheProtocol, MemcachedObjectCache};
#[cfg(feature = "redis-backend")]
pub use redis_cache::RedisObjectCache;
pub use registry::{BackendEndpoints, BackendRegistry};

#[derive(Debug, Error)]
pub enum ObjectCacheError {
    #[cfg(feature = "redis-backend")]
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[cfg(feature = "memcached-backend")]
    #[error("memcached: {0}")]
    Memcache(#[from] memcache::MemcacheError),
    #[error("object cache task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum BackendConfigError {
    #[error("object cache backend `{backend}` is not available in this build")]
    Unavailable { backend: InMemoryCache },
    #[error("object cache backend `{backend}` has no endpoint configured")]
    MissingEndpoint { backend: InMemoryCache },
    #[error("failed to connect to `{backend}` object cache: {source}")]
    Connect {
        backend: InMemoryCache,
        #[source]
        source: ObjectCacheError,
    },
}

/// Operations every backend supports. `ttl` of `None` stores without expiry.
#[async_trait]
pub trait ObjectCache: Send + Sync {
    fn backend(&self) -> InMemoryCache;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectCacheError>;

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), ObjectCacheError>;

    async fn delete(&self, key: &str) -> Result<bool, ObjectCacheError>;

    /// Empties the whole backend.
    async fn flush(&self) -> Result<(), ObjectCacheError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed,
    NoBackend,
    Failed,
}

/// The currently selected backend, if any. Swapped on settings updates.
#[derive(Clone, Default)]
pub struct ObjectCacheSlot {
    inner: Arc<RwLock<Option<Arc<dyn ObjectCache>>>>,
}

impl fmt::Debug for ObjectCacheSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCacheSlot")
            .field("backend", &self.current().map(|cache| cache.backend()))
            .finish()
    }
}

impl ObjectCacheSlot {
    pub fn new(cache: Option<Arc<dyn ObjectCache>>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(cache)),
        }
    }

    pub fn current(&self) -> Option<Arc<dyn ObjectCache>> {
        rw_read(&self.inner, "cache::object", "current").clone()
    }

    /// Installs `next` and returns the backend it replaced.
    pub fn replace(&self, next: Option<Arc<dyn ObjectCache>>) -> Option<Arc<dyn ObjectCache>> {
        let mut guard = rw_write(&self.inner, "cache::object", "replace");
        std::mem::replace(&mut *guard, next)
    }

    pub async fn flush(&self) -> FlushOutcome {
        let Some(cache) = self.current() else {
            return FlushOutcome::NoBackend;
        };
        flush_backend(cache.as_ref()).await
    }
}

/// Flushes one backend, logging rather than propagating failures.
pub async fn flush_backend(cache: &dyn ObjectCache) -> FlushOutcome {
    match cache.flush().await {
        Ok(()) => {
            metrics::counter!("sitecache_object_cache_flush_total", "result" => "ok").increment(1);
            tracing::info!(
                target = "sitecache::cache::object",
                backend = %cache.backend(),
                "Flushed object cache"
            );
            FlushOutcome::Flushed
        }
        Err(err) => {
            metrics::counter!("sitecache_object_cache_flush_total", "result" => "error")
                .increment(1);
            tracing::warn!(
                target = "sitecache::cache::object",
                backend = %cache.backend(),
                error = %err,
                "Object cache flush failed"
            );
            FlushOutcome::Failed
        }
    }
}
