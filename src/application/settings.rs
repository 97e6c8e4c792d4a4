//! Cache settings lifecycle: updates, purges, and deactivation.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::error::AppError;
use crate::cache::{
    AccessArea, AccessProblem, BackendConfigError, BackendRegistry, CacheConfig, ConfigHandle,
    InMemoryCache, Invalidator, ObjectCache, ObjectCacheSlot, PageStore, PurgeReport,
    SweepScheduler, Sweeper, TenantSet, object::flush_backend, verify_access,
};
use crate::infra::error::InfraError;

pub const CONFIG_FILE_NAME: &str = "cache.toml";

/// Persists the cache config as TOML under the config directory.
#[derive(Debug, Clone)]
pub struct ConfigRepository {
    path: PathBuf,
}

impl ConfigRepository {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(CONFIG_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<CacheConfig>, InfraError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let config: CacheConfig = toml::from_str(&text).map_err(|err| {
            InfraError::configuration(format!("{}: {err}", self.path.display()))
        })?;
        Ok(Some(config))
    }

    /// Writes through a temp file so a crash never leaves a torn config.
    pub async fn save(&self, config: &CacheConfig) -> Result<(), InfraError> {
        let text = toml::to_string(config)
            .map_err(|err| InfraError::persistence(&self.path, err.to_string()))?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|err| InfraError::persistence(dir, err.to_string()))?;
        }
        let temp = self
            .path
            .with_file_name(format!(".{CONFIG_FILE_NAME}.{}", Uuid::new_v4().simple()));
        if let Err(err) = fs::write(&temp, text).await {
            return Err(InfraError::persistence(&temp, err.to_string()));
        }
        if let Err(err) = fs::rename(&temp, &self.path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(InfraError::persistence(&self.path, err.to_string()));
        }
        Ok(())
    }

    pub async fn remove(&self) -> Result<(), InfraError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(InfraError::persistence(&self.path, err.to_string())),
        }
    }
}

/// Directories checked before settings are applied.
#[derive(Debug, Clone)]
pub struct AccessPaths {
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
}

/// Which tenants a purge covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeScope {
    /// The primary site, or the tenant with the given id.
    Site(Option<String>),
    Network,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettingsOutcome {
    pub applied: bool,
    pub config: CacheConfig,
    pub access_problems: Vec<AccessProblem>,
    pub warnings: Vec<String>,
    pub purge: Option<PurgeReport>,
    pub sweep_interval_secs: Option<u64>,
}

pub struct CacheSettingsService {
    config: ConfigHandle,
    repository: ConfigRepository,
    registry: BackendRegistry,
    object_cache: ObjectCacheSlot,
    invalidator: Invalidator,
    scheduler: Arc<SweepScheduler>,
    tenants: Arc<TenantSet>,
    paths: AccessPaths,
    updates: Mutex<()>,
}

impl CacheSettingsService {
    pub fn new(
        config: ConfigHandle,
        store: Arc<PageStore>,
        tenants: Arc<TenantSet>,
        registry: BackendRegistry,
        repository: ConfigRepository,
        paths: AccessPaths,
    ) -> Self {
        let object_cache = ObjectCacheSlot::default();
        let invalidator = Invalidator::new(Arc::clone(&store), object_cache.clone());
        let sweeper = Arc::new(Sweeper::new(store, config.clone(), Arc::clone(&tenants)));
        Self {
            config,
            repository,
            registry,
            object_cache,
            invalidator,
            scheduler: Arc::new(SweepScheduler::new(sweeper)),
            tenants,
            paths,
            updates: Mutex::new(()),
        }
    }

    pub fn current(&self) -> CacheConfig {
        self.config.snapshot().config().clone()
    }

    pub fn config_handle(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn object_cache(&self) -> &ObjectCacheSlot {
        &self.object_cache
    }

    pub fn scheduler(&self) -> &Arc<SweepScheduler> {
        &self.scheduler
    }

    pub fn tenants(&self) -> &Arc<TenantSet> {
        &self.tenants
    }

    /// Connects the configured backend and starts the sweep schedule for
    /// the config already installed. Returns non-fatal warnings.
    pub async fn activate(&self) -> Vec<String> {
        let _guard = self.updates.lock().await;
        let snapshot = self.config.snapshot();
        let mut warnings = Vec::new();

        if let Some(backend) = snapshot.config().object_cache_backend() {
            match self.registry.connect(backend).await {
                Ok(cache) => {
                    self.object_cache.replace(Some(cache));
                }
                Err(err) => {
                    warn!(
                        target = "sitecache::application::settings",
                        backend = %backend,
                        error = %err,
                        "Object cache unavailable; continuing without it"
                    );
                    warnings.push(err.to_string());
                }
            }
        }

        self.scheduler.reconcile_with(&snapshot);
        warnings
    }

    pub async fn check_access(&self) -> Vec<AccessProblem> {
        verify_access(&self.paths.config_dir, &self.paths.cache_dir).await
    }

    /// Validates, persists, and installs `next`.
    ///
    /// When the cache directory is not writable nothing is applied: stored
    /// pages are purged and the problems are returned.
    pub async fn update(&self, next: CacheConfig) -> Result<SettingsOutcome, AppError> {
        let _guard = self.updates.lock().await;

        next.validate().map_err(AppError::validation)?;

        let access_problems = self.check_access().await;
        if access_problems
            .iter()
            .any(|problem| problem.area == AccessArea::Cache)
        {
            warn!(
                target = "sitecache::application::settings",
                problems = ?access_problems,
                "Cache directory not writable; settings not applied"
            );
            let purge = self.purge_all().await;
            return Ok(SettingsOutcome {
                applied: false,
                config: self.current(),
                access_problems,
                warnings: Vec::new(),
                purge: Some(purge),
                sweep_interval_secs: self.sweep_interval_secs(),
            });
        }

        let mut warnings = Vec::new();
        let backend = self.resolve_backend(&next, &mut warnings).await?;

        if let Err(err) = self.repository.save(&next).await {
            warn!(
                target = "sitecache::application::settings",
                error = %err,
                "Failed to persist cache settings"
            );
            warnings.push(err.to_string());
        }

        let previous = self.config.replace(next.clone());
        if let Some(replacement) = backend {
            self.swap_backend(replacement).await;
        }

        let invalidate = (previous.page_caching_enabled() && !next.enable_page_caching)
            || previous.compression_enabled() != next.enable_gzip_compression;
        let purge = if invalidate {
            Some(self.purge_all().await)
        } else {
            None
        };

        let change = self.scheduler.reconcile_with(&self.config.snapshot());
        info!(
            target = "sitecache::application::settings",
            enabled = next.enable_page_caching,
            ttl_secs = next.ttl().as_secs(),
            purged = purge.is_some(),
            schedule = ?change,
            "Applied cache settings"
        );

        Ok(SettingsOutcome {
            applied: true,
            config: next,
            access_problems,
            warnings,
            purge,
            sweep_interval_secs: self.sweep_interval_secs(),
        })
    }

    /// Returns `Some(new_backend)` when the slot must change.
    async fn resolve_backend(
        &self,
        next: &CacheConfig,
        warnings: &mut Vec<String>,
    ) -> Result<Option<Option<Arc<dyn ObjectCache>>>, AppError> {
        let current = self.object_cache.current().map(|cache| cache.backend());
        let Some(wanted) = next.object_cache_backend() else {
            return Ok(current.map(|_| None));
        };
        if current == Some(wanted) {
            return Ok(None);
        }

        self.registry.check(wanted)?;
        match self.registry.connect(wanted).await {
            Ok(cache) => Ok(Some(Some(cache))),
            Err(err @ BackendConfigError::Connect { .. }) => {
                warn!(
                    target = "sitecache::application::settings",
                    backend = %wanted,
                    error = %err,
                    "Object cache unreachable; continuing without it"
                );
                warnings.push(err.to_string());
                Ok(current.map(|_| None))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn swap_backend(&self, replacement: Option<Arc<dyn ObjectCache>>) {
        let next_kind: Option<InMemoryCache> = replacement.as_ref().map(|cache| cache.backend());
        if let Some(previous) = self.object_cache.replace(replacement) {
            info!(
                target = "sitecache::application::settings",
                from = %previous.backend(),
                to = ?next_kind,
                "Switching object cache backend"
            );
            flush_backend(previous.as_ref()).await;
        }
    }

    pub async fn purge(&self, scope: PurgeScope) -> Result<PurgeReport, AppError> {
        match scope {
            PurgeScope::Network => Ok(self.purge_all().await),
            PurgeScope::Site(None) => {
                let tenant = self
                    .tenants
                    .primary()
                    .ok_or_else(|| AppError::not_found("no tenant configured"))?;
                Ok(self.invalidator.purge(tenant).await)
            }
            PurgeScope::Site(Some(id)) => {
                let tenant = self
                    .tenants
                    .get(&id)
                    .ok_or_else(|| AppError::not_found(format!("tenant `{id}`")))?;
                Ok(self.invalidator.purge(tenant).await)
            }
        }
    }

    async fn purge_all(&self) -> PurgeReport {
        if self.tenants.is_network() {
            self.invalidator.purge_network(self.tenants.iter()).await
        } else {
            match self.tenants.primary() {
                Some(tenant) => self.invalidator.purge(tenant).await,
                None => PurgeReport::default(),
            }
        }
    }

    /// Tears the cache down: purge everything, stop the sweep schedule,
    /// disable page caching, and drop the persisted settings.
    pub async fn deactivate(&self) -> Result<PurgeReport, AppError> {
        let _guard = self.updates.lock().await;

        let report = self.purge_all().await;
        self.scheduler.cancel();

        let disabled = CacheConfig {
            enable_page_caching: false,
            ..self.current()
        };
        self.config.replace(disabled);
        self.object_cache.replace(None);
        self.repository.remove().await?;

        info!(
            target = "sitecache::application::settings",
            removed = report.entries_removed,
            "Cache deactivated"
        );
        Ok(report)
    }

    fn sweep_interval_secs(&self) -> Option<u64> {
        self.scheduler
            .current_interval()
            .map(|interval| interval.as_secs())
    }
}
