use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{BackendConfigError, ObjectCache};
use crate::cache::config::InMemoryCache;

/// Where each backend kind lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEndpoints {
    pub redis_url: Option<String>,
    pub memcached_url: Option<String>,
}

/// Maps a configured [`InMemoryCache`] to a connected backend.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    endpoints: BackendEndpoints,
}

impl BackendRegistry {
    pub fn new(endpoints: BackendEndpoints) -> Self {
        Self { endpoints }
    }

    pub fn endpoints(&self) -> &BackendEndpoints {
        &self.endpoints
    }

    /// Whether this build carries a client for `backend`.
    pub const fn is_compiled(backend: InMemoryCache) -> bool {
        match backend {
            InMemoryCache::Redis => cfg!(feature = "redis-backend"),
            InMemoryCache::Memcached | InMemoryCache::Memcache => {
                cfg!(feature = "memcached-backend")
            }
        }
    }

    pub fn available() -> Vec<InMemoryCache> {
        [
            InMemoryCache::Redis,
            InMemoryCache::Memcached,
            InMemoryCache::Memcache,
        ]
        .into_iter()
        .filter(|backend| Self::is_compiled(*backend))
        .collect()
    }

    /// Checks that `backend` could be connected, without connecting.
    pub fn check(&self, backend: InMemoryCache) -> Result<(), BackendConfigError> {
        if !Self::is_compiled(backend) {
            return Err(BackendConfigError::Unavailable { backend });
        }
        self.endpoint(backend).map(|_| ())
    }

    fn endpoint(&self, backend: InMemoryCache) -> Result<&str, BackendConfigError> {
        let url = match backend {
            InMemoryCache::Redis => self.endpoints.redis_url.as_deref(),
            InMemoryCache::Memcached | InMemoryCache::Memcache => {
                self.endpoints.memcached_url.as_deref()
            }
        };
        url.map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(BackendConfigError::MissingEndpoint { backend })
    }

    pub async fn connect(
        &self,
        backend: InMemoryCache,
    ) -> Result<Arc<dyn ObjectCache>, BackendConfigError> {
        self.check(backend)?;
        let url = self.endpoint(backend)?;
        let cache = match backend {
            InMemoryCache::Redis => connect_redis(url).await?,
            InMemoryCache::Memcached | InMemoryCache::Memcache => {
                connect_memcached(url, backend).await?
            }
        };
        info!(
            target = "sitecache::cache::object",
            backend = %backend,
            "Connected object cache"
        );
        Ok(cache)
    }
}

#[cfg(feature = "redis-backend")]
async fn connect_redis(url: &str) -> Result<Arc<dyn ObjectCache>, BackendConfigError> {
    super::RedisObjectCache::connect(url)
        .await
        .map(|cache| Arc::new(cache) as Arc<dyn ObjectCache>)
        .map_err(|source| BackendConfigError::Connect {
            backend: InMemoryCache::Redis,
            source,
        })
}

#[cfg(not(feature = "redis-backend"))]
async fn connect_redis(_url: &str) -> Result<Arc<dyn ObjectCache>, BackendConfigError> {
    Err(BackendConfigError::Unavailable {
        backend: InMemoryCache::Redis,
    })
}

#[cfg(feature = "memcached-backend")]
async fn connect_memcached(
    url: &str,
    backend: InMemoryCache,
) -> Result<Arc<dyn ObjectCache>, BackendConfigError> {
    let protocol = match backend {
        InMemoryCache::Memcache => super::MemcacheProtocol::Ascii,
        _ => super::MemcacheProtocol::Binary,
    };
    super::MemcachedObjectCache::connect(url, protocol)
        .await
        .map(|cache| Arc::new(cache) as Arc<dyn ObjectCache>)
        .map_err(|source| BackendConfigError::Connect { backend, source })
}

#[cfg(not(feature = "memcached-backend"))]
async fn connect_memcached(
    _url: &str,
    backend: InMemoryCache,
) -> Result<Arc<dyn ObjectCache>, BackendConfigError> {
    Err(BackendConfigError::Unavailable { backend })
}
