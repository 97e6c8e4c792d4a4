//! Cache configuration.
//!
//! The persisted record that drives the page cache, plus the compiled
//! [`ActiveConfig`] snapshot that request handling and the sweeper read.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use super::exceptions::ExceptionRules;
use super::lock::{rw_read, rw_write};

const DEFAULT_PAGE_CACHE_LENGTH: f64 = 24.0;
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Unit applied to `page_cache_length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheLengthUnit {
    Minutes,
    #[default]
    Hours,
    Days,
    Weeks,
}

impl CacheLengthUnit {
    pub const fn seconds(self) -> u64 {
        match self {
            Self::Minutes => 60,
            Self::Hours => 60 * 60,
            Self::Days => 24 * 60 * 60,
            Self::Weeks => 7 * 24 * 60 * 60,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
            Self::Weeks => "weeks",
        }
    }
}

impl fmt::Display for CacheLengthUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheLengthUnit {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "minutes" => Ok(Self::Minutes),
            "hours" => Ok(Self::Hours),
            "days" => Ok(Self::Days),
            "weeks" => Ok(Self::Weeks),
            other => Err(format!("unknown cache length unit `{other}`")),
        }
    }
}

/// Object cache backend selection.
///
/// `Memcached` is the modern client (binary protocol); `Memcache` is the
/// legacy text-protocol client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InMemoryCache {
    Redis,
    #[default]
    Memcached,
    Memcache,
}

impl InMemoryCache {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Memcached => "memcached",
            Self::Memcache => "memcache",
        }
    }
}

impl fmt::Display for InMemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InMemoryCache {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memcached" => Ok(Self::Memcached),
            "memcache" => Ok(Self::Memcache),
            other => Err(format!("unknown object cache backend `{other}`")),
        }
    }
}

/// Persisted cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Gates whether exception rules apply at all.
    pub advanced_mode: bool,
    pub enable_page_caching: bool,
    pub page_cache_length: f64,
    pub page_cache_length_unit: CacheLengthUnit,
    pub enable_gzip_compression: bool,
    /// One rule per line. Accepts a multi-line string or a list.
    #[serde(deserialize_with = "lines_or_list")]
    pub cache_exception_urls: Vec<String>,
    pub enable_url_exemption_regex: bool,
    pub enable_in_memory_object_caching: bool,
    pub in_memory_cache: InMemoryCache,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            advanced_mode: false,
            enable_page_caching: false,
            page_cache_length: DEFAULT_PAGE_CACHE_LENGTH,
            page_cache_length_unit: CacheLengthUnit::default(),
            enable_gzip_compression: false,
            cache_exception_urls: Vec::new(),
            enable_url_exemption_regex: false,
            enable_in_memory_object_caching: false,
            in_memory_cache: InMemoryCache::default(),
        }
    }
}

impl CacheConfig {
    /// Rejects lengths that would not produce a positive, finite TTL.
    pub fn validate(&self) -> Result<(), String> {
        if !self.page_cache_length.is_finite() || self.page_cache_length <= 0.0 {
            return Err(format!(
                "page_cache_length must be a positive number, got {}",
                self.page_cache_length
            ));
        }
        let seconds = self.page_cache_length * self.page_cache_length_unit.seconds() as f64;
        if Duration::try_from_secs_f64(seconds).is_err() {
            return Err(format!("page_cache_length {seconds}s is out of range"));
        }
        Ok(())
    }

    /// Time-to-live of a stored page. Invalid lengths collapse to zero,
    /// which makes every entry stale.
    pub fn ttl(&self) -> Duration {
        let seconds = self.page_cache_length * self.page_cache_length_unit.seconds() as f64;
        if !seconds.is_finite() || seconds <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }

    /// Sweep period: one unit, or the TTL when that is shorter.
    pub fn sweep_interval(&self) -> Duration {
        let unit = Duration::from_secs(self.page_cache_length_unit.seconds());
        unit.min(self.ttl()).max(MIN_SWEEP_INTERVAL)
    }

    /// Exception rule lines, split on line boundaries with blanks dropped.
    pub fn exception_lines(&self) -> impl Iterator<Item = &str> {
        self.cache_exception_urls
            .iter()
            .flat_map(|entry| entry.split(['\n', '\r']))
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }

    pub fn object_cache_backend(&self) -> Option<InMemoryCache> {
        self.enable_in_memory_object_caching
            .then_some(self.in_memory_cache)
    }
}

fn lines_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        List(Vec<String>),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text
            .split(['\n', '\r'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        Raw::List(list) => list,
    })
}

/// A config record with its derived state precomputed.
#[derive(Debug)]
pub struct ActiveConfig {
    config: CacheConfig,
    ttl: Duration,
    rules: ExceptionRules,
}

impl ActiveConfig {
    pub fn new(config: CacheConfig) -> Self {
        let ttl = config.ttl();
        let rules = ExceptionRules::compile(&config);
        Self { config, ttl, rules }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn rules(&self) -> &ExceptionRules {
        &self.rules
    }

    pub fn page_caching_enabled(&self) -> bool {
        self.config.enable_page_caching
    }

    pub fn compression_enabled(&self) -> bool {
        self.config.enable_gzip_compression
    }
}

/// Shared, swappable view of the current config.
///
/// Readers take a snapshot and keep it for the duration of one request or
/// sweep, so a concurrent update never changes rules mid-decision.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<ActiveConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(ActiveConfig::new(config)))),
        }
    }

    pub fn snapshot(&self) -> Arc<ActiveConfig> {
        rw_read(&self.inner, "cache::config", "snapshot").clone()
    }

    /// Installs `config` and returns the snapshot it replaced.
    pub fn replace(&self, config: CacheConfig) -> Arc<ActiveConfig> {
        let next = Arc::new(ActiveConfig::new(config));
        let mut guard = rw_write(&self.inner, "cache::config", "replace");
        std::mem::replace(&mut *guard, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(length: f64, unit: CacheLengthUnit) -> CacheConfig {
        CacheConfig {
            page_cache_length: length,
            page_cache_length_unit: unit,
            ..CacheConfig::default()
        }
    }

    #[test]
    fn ttl_multiplies_length_by_unit() {
        assert_eq!(
            config(5.0, CacheLengthUnit::Minutes).ttl(),
            Duration::from_secs(300)
        );
        assert_eq!(
            config(1.5, CacheLengthUnit::Hours).ttl(),
            Duration::from_secs(5400)
        );
        assert_eq!(
            config(2.0, CacheLengthUnit::Weeks).ttl(),
            Duration::from_secs(2 * 604_800)
        );
    }

    #[test]
    fn non_positive_length_is_rejected_and_yields_zero_ttl() {
        for length in [0.0, -3.0, f64::NAN, f64::INFINITY] {
            let cfg = config(length, CacheLengthUnit::Days);
            assert!(cfg.validate().is_err(), "{length} should be invalid");
            assert_eq!(cfg.ttl(), Duration::ZERO);
        }
    }

    #[test]
    fn sweep_interval_is_unit_or_shorter_ttl() {
        assert_eq!(
            config(24.0, CacheLengthUnit::Hours).sweep_interval(),
            Duration::from_secs(3600)
        );
        assert_eq!(
            config(0.5, CacheLengthUnit::Minutes).sweep_interval(),
            Duration::from_secs(30)
        );
        assert_eq!(
            config(0.001, CacheLengthUnit::Minutes).sweep_interval(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn exception_urls_accept_multiline_text() {
        let cfg: CacheConfig = toml::from_str(
            r#"
            advanced_mode = true
            cache_exception_urls = "/cart\r\n\n  /account/*  \n"
            "#,
        )
        .expect("parse config");
        assert_eq!(cfg.cache_exception_urls, vec!["/cart", "/account/*"]);
        assert_eq!(cfg.page_cache_length_unit, CacheLengthUnit::Hours);
    }

    #[test]
    fn exception_lines_split_list_entries() {
        let cfg = CacheConfig {
            cache_exception_urls: vec!["/a\n/b".to_string(), "  ".to_string(), "/c".to_string()],
            ..CacheConfig::default()
        };
        assert_eq!(cfg.exception_lines().collect::<Vec<_>>(), ["/a", "/b", "/c"]);
    }

    #[test]
    fn backend_names_parse_case_insensitively() {
        assert_eq!("Redis".parse::<InMemoryCache>(), Ok(InMemoryCache::Redis));
        assert_eq!(
            "memcache".parse::<InMemoryCache>(),
            Ok(InMemoryCache::Memcache)
        );
        assert!("apc".parse::<InMemoryCache>().is_err());
    }

    #[test]
    fn replace_returns_previous_snapshot() {
        let handle = ConfigHandle::new(CacheConfig::default());
        let held = handle.snapshot();
        let previous = handle.replace(CacheConfig {
            enable_page_caching: true,
            ..CacheConfig::default()
        });
        assert!(!previous.page_caching_enabled());
        assert!(!held.page_caching_enabled());
        assert!(handle.snapshot().page_caching_enabled());
    }
}
