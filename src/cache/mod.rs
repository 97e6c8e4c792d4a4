//! Full-page cache.
//!
//! - **Gate**: decides per request whether caching applies at all
//! - **Store**: one file per page on disk, written atomically
//! - **Capture**: stores origin output on a miss
//! - **Invalidator** and **Sweeper**: remove pages on purge and on expiry
//! - **Object cache**: the external in-memory backend flushed alongside
//!
//! ## Configuration
//!
//! ```toml
//! enable_page_caching = true
//! page_cache_length = 24
//! page_cache_length_unit = "hours"
//! enable_gzip_compression = true
//! advanced_mode = true
//! cache_exception_urls = "/cart\n/account/*"
//! ```

pub mod access;
pub mod capture;
mod config;
mod exceptions;
pub mod gate;
mod invalidator;
mod keys;
mod lock;
mod middleware;
pub mod object;
mod store;
mod sweeper;

pub use access::{AccessArea, AccessProblem, verify_access};
pub use config::{ActiveConfig, CacheConfig, CacheLengthUnit, ConfigHandle, InMemoryCache};
pub use exceptions::{ExceptionRule, ExceptionRules, RuleInput};
pub use gate::{BypassReason, CacheRequest, Classification, CookiePolicy, classify};
pub use invalidator::{Invalidator, PurgeFailure, PurgeReport};
pub use keys::{StorageKey, Tenant, TenantSet, resolve};
pub use middleware::{CACHE_STATUS_HEADER, PageCacheState, page_cache_layer};
pub use object::{
    BackendConfigError, BackendEndpoints, BackendRegistry, FlushOutcome, ObjectCache,
    ObjectCacheError, ObjectCacheSlot,
};
pub use store::{Encoding, GZIP_FILE, PAGE_FILE, PageStore, StoreError, StoredPage};
pub use sweeper::{ScheduleChange, SweepReport, SweepScheduler, Sweeper, desired_interval};
