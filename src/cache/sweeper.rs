//! Periodic removal of expired pages.
//!
//! [`Sweeper`] walks every tenant subtree once per tick. [`SweepScheduler`]
//! owns the single recurring task and reconciles it against the live
//! config, so concurrent settings updates never leave two schedules alive.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use metrics::{counter, histogram};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::config::{ActiveConfig, ConfigHandle};
use super::keys::{StorageKey, TenantSet};
use super::lock::mutex_lock;
use super::store::{PageStore, age_between};

const METRIC_SWEEP_EVICTED: &str = "sitecache_sweep_evicted_total";
const METRIC_SWEEP_MS: &str = "sitecache_sweep_ms";

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub evicted: usize,
    pub temp_files_removed: usize,
    pub dirs_pruned: usize,
}

#[derive(Debug)]
pub struct Sweeper {
    store: Arc<PageStore>,
    config: ConfigHandle,
    tenants: Arc<TenantSet>,
}

impl Sweeper {
    pub fn new(store: Arc<PageStore>, config: ConfigHandle, tenants: Arc<TenantSet>) -> Self {
        Self {
            store,
            config,
            tenants,
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(SystemTime::now()).await
    }

    /// Deletes every entry whose age at `now` has reached the current TTL.
    pub async fn sweep_at(&self, now: SystemTime) -> SweepReport {
        let started_at = Instant::now();
        let ttl = self.config.snapshot().ttl();
        let mut report = SweepReport::default();

        for prefix in self.roots() {
            let scan = match self.store.scan(&prefix).await {
                Ok(scan) => scan,
                Err(err) => {
                    warn!(
                        target = "sitecache::cache::sweeper",
                        prefix = %prefix,
                        error = %err,
                        "Skipping subtree that could not be scanned"
                    );
                    continue;
                }
            };

            for entry in &scan.entries {
                report.scanned += 1;
                if age_between(entry.created_at, now) < ttl {
                    continue;
                }
                // The entry may have been rewritten since the scan.
                let still_expired = self
                    .store
                    .age_at(&entry.key, now)
                    .await
                    .is_some_and(|age| age >= ttl);
                if !still_expired {
                    continue;
                }
                match self.store.delete(&entry.key).await {
                    Ok(true) => report.evicted += 1,
                    Ok(false) => {}
                    Err(err) => warn!(
                        target = "sitecache::cache::sweeper",
                        key = %entry.key,
                        error = %err,
                        "Failed to evict expired page"
                    ),
                }
            }

            for temp in &scan.temp_files {
                if age_between(temp.modified, now) < ttl {
                    continue;
                }
                if let Ok(true) = self.store.remove_temp(&temp.path).await {
                    report.temp_files_removed += 1;
                }
            }

            report.dirs_pruned += self.store.prune_empty_dirs(&scan.dirs).await;
        }

        counter!(METRIC_SWEEP_EVICTED).increment(report.evicted as u64);
        histogram!(METRIC_SWEEP_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        debug!(
            target = "sitecache::cache::sweeper",
            scanned = report.scanned,
            evicted = report.evicted,
            temp_files = report.temp_files_removed,
            dirs = report.dirs_pruned,
            "Sweep complete"
        );
        report
    }

    /// Tenant prefixes with nested prefixes folded into their parent.
    fn roots(&self) -> Vec<StorageKey> {
        let prefixes: BTreeSet<StorageKey> =
            self.tenants.iter().map(|tenant| tenant.key_prefix()).collect();
        prefixes
            .iter()
            .filter(|prefix| {
                !prefixes
                    .iter()
                    .any(|other| other != *prefix && prefix.is_within(other))
            })
            .cloned()
            .collect()
    }
}

/// Interval the sweep should run at under `config`, or `None` when page
/// caching is off.
pub fn desired_interval(config: &ActiveConfig) -> Option<Duration> {
    config
        .page_caching_enabled()
        .then(|| config.config().sweep_interval())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleChange {
    Unchanged,
    Started(Duration),
    Rescheduled { from: Duration, to: Duration },
    Cancelled,
    Idle,
}

struct ScheduledSweep {
    interval: Duration,
    handle: JoinHandle<()>,
}

/// Holds at most one recurring sweep task.
pub struct SweepScheduler {
    sweeper: Arc<Sweeper>,
    slot: Mutex<Option<ScheduledSweep>>,
}

impl SweepScheduler {
    pub fn new(sweeper: Arc<Sweeper>) -> Self {
        Self {
            sweeper,
            slot: Mutex::new(None),
        }
    }

    pub fn sweeper(&self) -> &Arc<Sweeper> {
        &self.sweeper
    }

    pub fn current_interval(&self) -> Option<Duration> {
        mutex_lock(&self.slot, "cache::sweeper", "current_interval")
            .as_ref()
            .map(|scheduled| scheduled.interval)
    }

    pub fn reconcile_with(&self, config: &ActiveConfig) -> ScheduleChange {
        self.reconcile(desired_interval(config))
    }

    /// Brings the schedule in line with `desired`. Cancel and respawn
    /// happen under one lock, so callers racing here leave exactly one
    /// task behind.
    pub fn reconcile(&self, desired: Option<Duration>) -> ScheduleChange {
        let mut slot = mutex_lock(&self.slot, "cache::sweeper", "reconcile");

        let change = match (slot.as_ref(), desired) {
            (Some(current), Some(interval))
                if current.interval == interval && !current.handle.is_finished() =>
            {
                return ScheduleChange::Unchanged;
            }
            (None, None) => return ScheduleChange::Idle,
            (Some(current), Some(interval)) => ScheduleChange::Rescheduled {
                from: current.interval,
                to: interval,
            },
            (None, Some(interval)) => ScheduleChange::Started(interval),
            (Some(_), None) => ScheduleChange::Cancelled,
        };

        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }
        if let Some(interval) = desired {
            *slot = Some(ScheduledSweep {
                interval,
                handle: spawn_sweep_loop(Arc::clone(&self.sweeper), interval),
            });
        }

        info!(
            target = "sitecache::cache::sweeper",
            change = ?change,
            "Sweep schedule updated"
        );
        change
    }

    pub fn cancel(&self) -> ScheduleChange {
        self.reconcile(None)
    }
}

impl Drop for SweepScheduler {
    fn drop(&mut self) {
        if let Some(scheduled) = mutex_lock(&self.slot, "cache::sweeper", "drop").take() {
            scheduled.handle.abort();
        }
    }
}

fn spawn_sweep_loop(sweeper: Arc<Sweeper>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweeper.sweep().await;
        }
    })
}
