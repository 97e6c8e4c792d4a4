use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    middleware,
    routing::get,
};
use metrics_util::debugging::DebuggingRecorder;
use sitecache::cache::{
    CacheConfig, ConfigHandle, CookiePolicy, Invalidator, ObjectCacheSlot, PageCacheState,
    PageStore, Sweeper, Tenant, TenantSet, page_cache_layer, resolve,
};
use tempfile::TempDir;
use tower::ServiceExt;

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(PageStore::new(dir.path()));
    let tenant = Tenant::new("main", "example.com", "");
    let tenants = Arc::new(TenantSet::single(tenant.clone()));
    let config = ConfigHandle::new(CacheConfig {
        enable_page_caching: true,
        ..CacheConfig::default()
    });

    let state = PageCacheState {
        config: config.clone(),
        store: Arc::clone(&store),
        tenants: Arc::clone(&tenants),
        cookies: Arc::new(CookiePolicy::default()),
    };
    let app = Router::new()
        .route("/{*path}", get(|| async { "<html>metrics</html>" }))
        .layer(middleware::from_fn_with_state(state, page_cache_layer));

    let key = resolve(&tenant, "/page/");
    for method in [Method::GET, Method::POST] {
        let request = Request::builder()
            .method(method)
            .uri("/page/")
            .header(header::HOST, "example.com")
            .body(Body::empty())
            .expect("request should build");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        assert_ne!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    for _ in 0..100 {
        if store.read(&key).await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let hit = Request::builder()
        .uri("/page/")
        .header(header::HOST, "example.com")
        .body(Body::empty())
        .expect("request should build");
    let response = app.clone().oneshot(hit).await.expect("router should respond");
    assert_eq!(response.status(), StatusCode::OK);

    let sweeper = Sweeper::new(Arc::clone(&store), config, Arc::clone(&tenants));
    sweeper.sweep().await;

    let invalidator = Invalidator::new(Arc::clone(&store), ObjectCacheSlot::default());
    invalidator.purge(&tenant).await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "sitecache_page_hit_total",
        "sitecache_page_miss_total",
        "sitecache_page_bypass_total",
        "sitecache_page_store_total",
        "sitecache_purge_total",
        "sitecache_sweep_evicted_total",
        "sitecache_sweep_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
