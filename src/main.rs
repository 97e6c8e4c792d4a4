use std::{process, sync::Arc};

use sitecache::{
    application::{
        admin_auth::AdminAuth,
        error::AppError,
        settings::{AccessPaths, CacheSettingsService, ConfigRepository, PurgeScope},
    },
    cache::{
        BackendRegistry, CacheConfig, ConfigHandle, PageCacheState, PageStore, verify_access,
    },
    config,
    infra::{
        error::InfraError,
        http::{self, AdminState, OriginState},
        telemetry,
    },
};
use tokio::try_join;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Purge(args) => run_purge(settings, args).await,
        config::Command::Sweep(_) => run_sweep(settings).await,
        config::Command::Check(_) => run_check(settings).await,
    }
}

struct ApplicationContext {
    settings: Arc<CacheSettingsService>,
    cache_state: PageCacheState,
}

/// Builds the cache core around the persisted config, falling back to the
/// `[cache]` section of the deployment settings.
async fn build_application_context(
    settings: &config::Settings,
) -> Result<ApplicationContext, AppError> {
    let repository = ConfigRepository::new(&settings.paths.config_dir);
    let initial = match repository.load().await {
        Ok(Some(persisted)) => persisted,
        Ok(None) => settings.cache.clone(),
        Err(err) => {
            warn!(
                target = "sitecache::bootstrap",
                path = %repository.path().display(),
                error = %err,
                "Ignoring unreadable persisted cache settings"
            );
            settings.cache.clone()
        }
    };
    let initial = validated_or_disabled(initial);

    let store = Arc::new(PageStore::new(&settings.paths.cache_dir));
    let handle = ConfigHandle::new(initial);
    let tenants = Arc::new(settings.site.tenants.clone());

    let service = Arc::new(CacheSettingsService::new(
        handle.clone(),
        Arc::clone(&store),
        Arc::clone(&tenants),
        BackendRegistry::new(settings.object_cache.clone()),
        repository,
        AccessPaths {
            config_dir: settings.paths.config_dir.clone(),
            cache_dir: settings.paths.cache_dir.clone(),
        },
    ));

    let cache_state = PageCacheState {
        config: handle,
        store,
        tenants,
        cookies: Arc::new(settings.site.cookies.clone()),
    };

    Ok(ApplicationContext {
        settings: service,
        cache_state,
    })
}

fn validated_or_disabled(config: CacheConfig) -> CacheConfig {
    match config.validate() {
        Ok(()) => config,
        Err(err) => {
            warn!(
                target = "sitecache::bootstrap",
                error = %err,
                "Invalid cache settings; page caching disabled until corrected"
            );
            CacheConfig {
                enable_page_caching: false,
                ..CacheConfig::default()
            }
        }
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let app = build_application_context(&settings).await?;

    for problem in app.settings.check_access().await {
        warn!(target = "sitecache::bootstrap", problem = %problem, "Access check failed");
    }
    for warning in app.settings.activate().await {
        warn!(target = "sitecache::bootstrap", warning = %warning, "Activation warning");
    }

    let admin_state = AdminState {
        settings: Arc::clone(&app.settings),
        auth: AdminAuth::new(settings.admin.token_hash.clone()),
    };
    if !admin_state.auth.is_enabled() {
        warn!(
            target = "sitecache::bootstrap",
            "No admin token configured; admin API will refuse every request"
        );
    }

    let origin = OriginState::new(settings.paths.document_root.clone());
    let result = serve_http(&settings, app.cache_state, origin, admin_state).await;

    app.settings.scheduler().cancel();
    result
}

async fn run_purge(settings: config::Settings, args: config::PurgeArgs) -> Result<(), AppError> {
    let app = build_application_context(&settings).await?;
    for warning in app.settings.activate().await {
        warn!(target = "sitecache::purge", warning = %warning, "Activation warning");
    }
    app.settings.scheduler().cancel();

    let scope = if args.network {
        PurgeScope::Network
    } else {
        PurgeScope::Site(args.tenant)
    };
    let report = app.settings.purge(scope).await?;

    info!(
        target = "sitecache::purge",
        tenants = report.tenants.len(),
        removed = report.entries_removed,
        object_cache_flushed = report.object_cache_flushed,
        failures = report.failures.len(),
        "Purge completed"
    );

    if report.failures.is_empty() {
        Ok(())
    } else {
        Err(AppError::unexpected(format!(
            "{} tenant(s) could not be fully purged",
            report.failures.len()
        )))
    }
}

async fn run_sweep(settings: config::Settings) -> Result<(), AppError> {
    let app = build_application_context(&settings).await?;
    let report = app.settings.scheduler().sweeper().sweep().await;
    info!(
        target = "sitecache::sweep",
        scanned = report.scanned,
        evicted = report.evicted,
        temp_files_removed = report.temp_files_removed,
        dirs_pruned = report.dirs_pruned,
        "Sweep completed"
    );
    Ok(())
}

async fn run_check(settings: config::Settings) -> Result<(), AppError> {
    let problems = verify_access(&settings.paths.config_dir, &settings.paths.cache_dir).await;
    if problems.is_empty() {
        info!(target = "sitecache::check", "Config and cache directories are writable");
        return Ok(());
    }

    for problem in &problems {
        error!(
            target = "sitecache::check",
            area = %problem.area,
            path = %problem.path.display(),
            "{problem}"
        );
    }
    Err(AppError::from(InfraError::configuration(format!(
        "{} directory access problem(s)",
        problems.len()
    ))))
}

async fn serve_http(
    settings: &config::Settings,
    cache_state: PageCacheState,
    origin: OriginState,
    admin_state: AdminState,
) -> Result<(), AppError> {
    let public_router = http::build_public_router(cache_state, origin);
    let admin_router = http::build_admin_router(admin_state);

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "sitecache::serve",
        public = %settings.server.public_addr,
        admin = %settings.server.admin_addr,
        "Listening"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let grace = settings.server.graceful_shutdown;
    tokio::spawn(async move {
        wait_for_signal().await;
        info!(target = "sitecache::serve", "Shutdown signal received");
        let _ = shutdown_tx.send(true);
        tokio::time::sleep(grace).await;
        warn!(
            target = "sitecache::serve",
            grace_secs = grace.as_secs(),
            "Graceful shutdown timed out"
        );
        process::exit(1);
    });

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(shutdown_requested(shutdown_rx.clone()));
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(shutdown_requested(shutdown_rx));

    try_join!(public_server, admin_server)
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_requested(mut rx: tokio::sync::watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target = "sitecache::serve", error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(target = "sitecache::serve", error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
