use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{ObjectCache, ObjectCacheError};
use crate::cache::config::InMemoryCache;

const MAX_KEY_LEN: usize = 250;
/// Memcached reads larger expirations as absolute unix timestamps.
const MAX_RELATIVE_EXPIRY: u64 = 30 * 24 * 60 * 60;

/// Wire protocol spoken to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemcacheProtocol {
    /// Modern client.
    Binary,
    /// Legacy text protocol client.
    Ascii,
}

/// Memcached backend. The client is blocking, so every call runs on the
/// blocking pool.
#[derive(Clone)]
pub struct MemcachedObjectCache {
    client: Arc<memcache::Client>,
    protocol: MemcacheProtocol,
}

impl MemcachedObjectCache {
    pub async fn connect(url: &str, protocol: MemcacheProtocol) -> Result<Self, ObjectCacheError> {
        let url = connection_url(url, protocol);
        let client = run_blocking(move || memcache::Client::connect(url.as_str())).await?;
        Ok(Self {
            client: Arc::new(client),
            protocol,
        })
    }
}

fn connection_url(url: &str, protocol: MemcacheProtocol) -> String {
    match protocol {
        MemcacheProtocol::Binary => url.to_string(),
        MemcacheProtocol::Ascii if url.contains("protocol=") => url.to_string(),
        MemcacheProtocol::Ascii => {
            let separator = if url.contains('?') { '&' } else { '?' };
            format!("{url}{separator}protocol=ascii")
        }
    }
}

/// Keys longer than the protocol limit, or containing whitespace or control
/// bytes, are replaced by their SHA-256 digest.
fn wire_key(key: &str) -> String {
    let valid = key.len() <= MAX_KEY_LEN
        && !key.is_empty()
        && !key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control());
    if valid {
        key.to_string()
    } else {
        format!("sha256:{}", hex::encode(Sha256::digest(key.as_bytes()).to_vec()))
    }
}

fn expiration(ttl: Option<Duration>, now: SystemTime) -> u32 {
    let Some(ttl) = ttl.filter(|ttl| !ttl.is_zero()) else {
        return 0;
    };
    let seconds = ttl.as_secs().max(1);
    let value = if seconds > MAX_RELATIVE_EXPIRY {
        let epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        epoch.saturating_add(seconds)
    } else {
        seconds
    };
    u32::try_from(value).unwrap_or(u32::MAX)
}

async fn run_blocking<T, F>(task: F) -> Result<T, ObjectCacheError>
where
    F: FnOnce() -> Result<T, memcache::MemcacheError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| ObjectCacheError::Task(err.to_string()))?
        .map_err(ObjectCacheError::from)
}

#[async_trait]
impl ObjectCache for MemcachedObjectCache {
    fn backend(&self) -> InMemoryCache {
        match self.protocol {
            MemcacheProtocol::Binary => InMemoryCache::Memcached,
            MemcacheProtocol::Ascii => InMemoryCache::Memcache,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectCacheError> {
        let client = Arc::clone(&self.client);
        let key = wire_key(key);
        run_blocking(move || client.get::<Vec<u8>>(&key)).await
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), ObjectCacheError> {
        let client = Arc::clone(&self.client);
        let key = wire_key(key);
        let value = value.to_vec();
        let expires = expiration(ttl, SystemTime::now());
        run_blocking(move || client.set(&key, value.as_slice(), expires)).await
    }

    async fn delete(&self, key: &str) -> Result<bool, ObjectCacheError> {
        let client = Arc::clone(&self.client);
        let key = wire_key(key);
        run_blocking(move || client.delete(&key)).await
    }

    async fn flush(&self) -> Result<(), ObjectCacheError> {
        let client = Arc::clone(&self.client);
        run_blocking(move || client.flush()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_protocol_selects_ascii() {
        assert_eq!(
            connection_url("memcache://127.0.0.1:11211", MemcacheProtocol::Ascii),
            "memcache://127.0.0.1:11211?protocol=ascii"
        );
        assert_eq!(
            connection_url("memcache://h:1?timeout=2", MemcacheProtocol::Ascii),
            "memcache://h:1?timeout=2&protocol=ascii"
        );
        assert_eq!(
            connection_url("memcache://h:1", MemcacheProtocol::Binary),
            "memcache://h:1"
        );
    }

    #[test]
    fn oversized_or_spaced_keys_are_hashed() {
        assert_eq!(wire_key("page:1"), "page:1");
        let hashed = wire_key("has space");
        assert!(hashed.starts_with("sha256:"));
        assert_eq!(wire_key(&"k".repeat(300)).len(), "sha256:".len() + 64);
    }

    #[test]
    fn long_ttls_become_absolute_timestamps() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(expiration(None, now), 0);
        assert_eq!(expiration(Some(Duration::from_secs(60)), now), 60);
        let week_x5 = Duration::from_secs(5 * 7 * 24 * 3600);
        assert_eq!(
            expiration(Some(week_x5), now),
            1_700_000_000 + 5 * 7 * 24 * 3600
        );
    }
}
