//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::application::admin_auth::hash_token;
use crate::cache::{BackendEndpoints, CacheConfig, CookiePolicy, Tenant, TenantSet};

pub use cli::{CliArgs, Command, PathArgs, PathOverrides, PurgeArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "sitecache";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 8080;
const DEFAULT_ADMIN_PORT: u16 = 8081;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_DIR: &str = "var/cache/pages";
const DEFAULT_CONFIG_DIR: &str = "var/config";
const DEFAULT_DOCUMENT_ROOT: &str = "public";
const DEFAULT_SITE_URL: &str = "http://localhost:8080/";
pub const DEFAULT_TENANT_ID: &str = "main";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub paths: PathSettings,
    pub site: SiteSettings,
    pub admin: AdminSettings,
    pub object_cache: BackendEndpoints,
    /// Cache settings used until an admin update has been persisted.
    pub cache: CacheConfig,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct PathSettings {
    pub cache_dir: PathBuf,
    pub config_dir: PathBuf,
    pub document_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SiteSettings {
    pub tenants: TenantSet,
    pub cookies: CookiePolicy,
}

#[derive(Debug, Clone, Default)]
pub struct AdminSettings {
    /// SHA-256 of the admin bearer token. `None` disables the admin API.
    pub token_hash: Option<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("SITECACHE")
            .separator("__")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Purge(args)) => raw.apply_path_overrides(&args.paths),
        Some(Command::Sweep(args)) | Some(Command::Check(args)) => {
            raw.apply_path_overrides(&args.paths)
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    paths: RawPathSettings,
    site: RawSiteSettings,
    admin: RawAdminSettings,
    object_cache: RawObjectCacheSettings,
    cache: CacheConfig,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(root) = overrides.document_root.as_ref() {
            self.paths.document_root = Some(root.clone());
        }
        if let Some(url) = overrides.site_url.as_ref() {
            self.site.url = Some(url.clone());
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.object_cache.redis_url = Some(url.clone());
        }
        if let Some(url) = overrides.memcached_url.as_ref() {
            self.object_cache.memcached_url = Some(url.clone());
        }

        self.apply_path_overrides(&overrides.paths);
    }

    fn apply_path_overrides(&mut self, overrides: &PathOverrides) {
        if let Some(dir) = overrides.cache_dir.as_ref() {
            self.paths.cache_dir = Some(dir.clone());
        }
        if let Some(dir) = overrides.config_dir.as_ref() {
            self.paths.config_dir = Some(dir.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            paths,
            site,
            admin,
            object_cache,
            cache,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let paths = build_path_settings(paths)?;
        let site = build_site_settings(site)?;
        let admin = build_admin_settings(admin);
        let object_cache = build_object_cache_settings(object_cache);
        cache
            .validate()
            .map_err(|reason| LoadError::invalid("cache.page_cache_length", reason))?;

        Ok(Self {
            server,
            logging,
            paths,
            site,
            admin,
            object_cache,
            cache,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_path_settings(paths: RawPathSettings) -> Result<PathSettings, LoadError> {
    let cache_dir = non_empty_path(paths.cache_dir, DEFAULT_CACHE_DIR, "paths.cache_dir")?;
    let config_dir = non_empty_path(paths.config_dir, DEFAULT_CONFIG_DIR, "paths.config_dir")?;
    let document_root = non_empty_path(
        paths.document_root,
        DEFAULT_DOCUMENT_ROOT,
        "paths.document_root",
    )?;

    Ok(PathSettings {
        cache_dir,
        config_dir,
        document_root,
    })
}

fn build_site_settings(site: RawSiteSettings) -> Result<SiteSettings, LoadError> {
    let tenants = if site.network {
        if site.tenants.is_empty() {
            return Err(LoadError::invalid(
                "site.tenants",
                "a network install needs at least one tenant",
            ));
        }
        let mut tenants = Vec::with_capacity(site.tenants.len());
        for raw in site.tenants {
            if raw.id.trim().is_empty() {
                return Err(LoadError::invalid("site.tenants", "tenant id must not be empty"));
            }
            if tenants.iter().any(|t: &Tenant| t.id == raw.id) {
                return Err(LoadError::invalid(
                    "site.tenants",
                    format!("duplicate tenant id `{}`", raw.id),
                ));
            }
            tenants.push(parse_tenant(&raw.id, &raw.url, "site.tenants")?);
        }
        TenantSet::network(tenants)
    } else {
        let url = site.url.unwrap_or_else(|| DEFAULT_SITE_URL.to_string());
        TenantSet::single(parse_tenant(DEFAULT_TENANT_ID, &url, "site.url")?)
    };

    let interaction_cookie = site
        .interaction_cookie
        .unwrap_or_else(|| crate::cache::gate::DEFAULT_INTERACTION_COOKIE.to_string());
    let cookies = CookiePolicy::new(site.auth_cookie_marker.as_deref(), &interaction_cookie);

    Ok(SiteSettings { tenants, cookies })
}

fn parse_tenant(id: &str, url: &str, key: &'static str) -> Result<Tenant, LoadError> {
    let parsed = Url::parse(url.trim())
        .map_err(|err| LoadError::invalid(key, format!("invalid URL `{url}`: {err}")))?;
    Tenant::from_url(id, &parsed)
        .ok_or_else(|| LoadError::invalid(key, format!("URL `{url}` has no host")))
}

fn build_admin_settings(admin: RawAdminSettings) -> AdminSettings {
    let token_hash = admin
        .token
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .map(|token| hash_token(&token));
    AdminSettings { token_hash }
}

fn build_object_cache_settings(raw: RawObjectCacheSettings) -> BackendEndpoints {
    let clean = |value: Option<String>| {
        value.and_then(|value| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
    };
    BackendEndpoints {
        redis_url: clean(raw.redis_url),
        memcached_url: clean(raw.memcached_url),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPathSettings {
    cache_dir: Option<PathBuf>,
    config_dir: Option<PathBuf>,
    document_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSiteSettings {
    url: Option<String>,
    network: bool,
    tenants: Vec<RawTenant>,
    auth_cookie_marker: Option<String>,
    interaction_cookie: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTenant {
    id: String,
    url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAdminSettings {
    token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawObjectCacheSettings {
    redis_url: Option<String>,
    memcached_url: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_empty_path(
    value: Option<PathBuf>,
    default: &str,
    key: &'static str,
) -> Result<PathBuf, LoadError> {
    let path = value.unwrap_or_else(|| PathBuf::from(default));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid(key, "path must not be empty"));
    }
    Ok(path)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
