//! Scoped invalidation of stored pages plus the object cache.

use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

use super::keys::Tenant;
use super::object::{FlushOutcome, ObjectCacheSlot};
use super::store::PageStore;

const METRIC_PURGE: &str = "sitecache_purge_total";

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PurgeReport {
    pub tenants: Vec<String>,
    pub entries_removed: usize,
    pub object_cache_flushed: bool,
    /// Tenants whose subtree could not be fully removed.
    pub failures: Vec<PurgeFailure>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PurgeFailure {
    pub tenant: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct Invalidator {
    store: Arc<PageStore>,
    object_cache: ObjectCacheSlot,
}

impl Invalidator {
    pub fn new(store: Arc<PageStore>, object_cache: ObjectCacheSlot) -> Self {
        Self {
            store,
            object_cache,
        }
    }

    /// Removes every entry of `tenant`, then flushes the object cache once.
    pub async fn purge(&self, tenant: &Tenant) -> PurgeReport {
        let mut report = PurgeReport::default();
        self.purge_pages(tenant, &mut report).await;
        report.object_cache_flushed = self.flush().await;
        counter!(METRIC_PURGE, "scope" => "site").increment(1);
        info!(
            target = "sitecache::cache::invalidator",
            tenant = %tenant.id,
            removed = report.entries_removed,
            flushed = report.object_cache_flushed,
            "Purged tenant"
        );
        report
    }

    /// Purges every tenant's pages, flushing the object cache a single time
    /// at the end.
    pub async fn purge_network<'a, I>(&self, tenants: I) -> PurgeReport
    where
        I: IntoIterator<Item = &'a Tenant>,
    {
        let mut report = PurgeReport::default();
        for tenant in tenants {
            self.purge_pages(tenant, &mut report).await;
        }
        report.object_cache_flushed = self.flush().await;
        counter!(METRIC_PURGE, "scope" => "network").increment(1);
        info!(
            target = "sitecache::cache::invalidator",
            tenants = report.tenants.len(),
            removed = report.entries_removed,
            flushed = report.object_cache_flushed,
            "Purged network"
        );
        report
    }

    async fn purge_pages(&self, tenant: &Tenant, report: &mut PurgeReport) {
        report.tenants.push(tenant.id.clone());
        match self.store.delete_subtree(&tenant.key_prefix()).await {
            Ok(removed) => report.entries_removed += removed,
            Err(err) => {
                warn!(
                    target = "sitecache::cache::invalidator",
                    tenant = %tenant.id,
                    error = %err,
                    "Failed to purge tenant pages"
                );
                report.failures.push(PurgeFailure {
                    tenant: tenant.id.clone(),
                    error: err.to_string(),
                });
            }
        }
    }

    async fn flush(&self) -> bool {
        self.object_cache.flush().await == FlushOutcome::Flushed
    }
}
