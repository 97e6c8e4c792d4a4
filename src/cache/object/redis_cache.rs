use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{ObjectCache, ObjectCacheError};
use crate::cache::config::InMemoryCache;

/// Redis backend over a reconnecting connection manager.
#[derive(Clone)]
pub struct RedisObjectCache {
    conn: ConnectionManager,
}

impl RedisObjectCache {
    pub async fn connect(url: &str) -> Result<Self, ObjectCacheError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ObjectCache for RedisObjectCache {
    fn backend(&self) -> InMemoryCache {
        InMemoryCache::Redis
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectCacheError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), ObjectCacheError> {
        let mut conn = self.conn.clone();
        match ttl.filter(|ttl| !ttl.is_zero()) {
            // SETEX only takes whole seconds; round partial seconds up.
            Some(ttl) => {
                let seconds = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
                let _: () = conn.set_ex(key, value, seconds).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, ObjectCacheError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn flush(&self) -> Result<(), ObjectCacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }
}
