use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the sitecache binary.
#[derive(Debug, Parser)]
#[command(name = "sitecache", version, about = "Full-page cache server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SITECACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching proxy and the admin API.
    Serve(Box<ServeArgs>),
    /// Remove stored pages and flush the object cache.
    Purge(PurgeArgs),
    /// Run one expiry sweep and exit.
    Sweep(PathArgs),
    /// Verify that the config and cache directories are writable.
    Check(PathArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PathOverrides {
    /// Override the directory pages are stored under.
    #[arg(long = "cache-dir", value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Override the directory the persisted cache settings live in.
    #[arg(long = "config-dir", value_name = "PATH")]
    pub config_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PathArgs {
    #[command(flatten)]
    pub paths: PathOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub paths: PathOverrides,

    /// Purge every tenant of a network install.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub network: bool,

    /// Purge a single tenant by id instead of the primary site.
    #[arg(long, value_name = "ID", conflicts_with = "network")]
    pub tenant: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub paths: PathOverrides,

    /// Override the public listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the public listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the directory the origin serves pages from.
    #[arg(long = "document-root", value_name = "PATH")]
    pub document_root: Option<PathBuf>,

    /// Override the primary site URL.
    #[arg(long = "site-url", value_name = "URL")]
    pub site_url: Option<String>,

    /// Override the Redis endpoint.
    #[arg(long = "redis-url", value_name = "URL")]
    pub redis_url: Option<String>,

    /// Override the Memcached endpoint.
    #[arg(long = "memcached-url", value_name = "URL")]
    pub memcached_url: Option<String>,
}
