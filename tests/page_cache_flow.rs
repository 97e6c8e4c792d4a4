use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use flate2::read::GzDecoder;
use http_body_util::BodyExt;
use sitecache::cache::{
    CACHE_STATUS_HEADER, CacheConfig, CacheLengthUnit, ConfigHandle, CookiePolicy, InMemoryCache,
    Invalidator, ObjectCache, ObjectCacheError, ObjectCacheSlot, PageCacheState, PageStore,
    StorageKey, Sweeper, Tenant, TenantSet, page_cache_layer, resolve,
};
use tempfile::TempDir;
use tower::ServiceExt;

const HOST: &str = "example.com";

fn enabled_config() -> CacheConfig {
    CacheConfig {
        enable_page_caching: true,
        page_cache_length: 1.0,
        page_cache_length_unit: CacheLengthUnit::Hours,
        ..CacheConfig::default()
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<PageStore>,
    config: ConfigHandle,
    tenants: Arc<TenantSet>,
    origin_calls: Arc<AtomicUsize>,
    router: Router,
}

impl Harness {
    fn new(config: CacheConfig) -> Self {
        Self::with_tenants(config, TenantSet::single(Tenant::new("main", HOST, "")))
    }

    fn with_tenants(config: CacheConfig, tenants: TenantSet) -> Self {
        Self::build(config, tenants, |dir| dir.join("pages"))
    }

    fn build(
        config: CacheConfig,
        tenants: TenantSet,
        store_root: impl FnOnce(&Path) -> PathBuf,
    ) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(PageStore::new(store_root(dir.path())));
        let config = ConfigHandle::new(config);
        let tenants = Arc::new(tenants);
        let origin_calls = Arc::new(AtomicUsize::new(0));

        let state = PageCacheState {
            config: config.clone(),
            store: Arc::clone(&store),
            tenants: Arc::clone(&tenants),
            cookies: Arc::new(CookiePolicy::default()),
        };

        let calls = Arc::clone(&origin_calls);
        let origin = move |request: Request<Body>| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if request.uri().path() == "/session/" {
                    return (
                        [(header::SET_COOKIE, "sid=abc")],
                        "<html>session</html>".to_string(),
                    )
                        .into_response();
                }
                (
                    [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                    format!("<html><body>{} render {n}</body></html>", request.uri().path()),
                )
                    .into_response()
            }
        };

        let router = Router::new()
            .route("/{*path}", get(origin.clone()).post(origin.clone()))
            .route("/", get(origin))
            .layer(middleware::from_fn_with_state(state, page_cache_layer));

        Self {
            _dir: dir,
            store,
            config,
            tenants,
            origin_calls,
            router,
        }
    }

    fn calls(&self) -> usize {
        self.origin_calls.load(Ordering::SeqCst)
    }

    fn key(&self, path: &str) -> StorageKey {
        let tenant = self.tenants.primary().expect("tenant");
        resolve(tenant, path)
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router response")
    }

    async fn get(&self, path: &str) -> Response {
        self.send(request(Method::GET, HOST, path)).await
    }

    async fn wait_for_entry(&self, key: &StorageKey) -> bool {
        for _ in 0..100 {
            if self.store.read(key).await.is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

fn request(method: Method, host: &str, path: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .header(header::HOST, host)
        .body(Body::empty())
        .expect("request")
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec()
}

fn status_header(response: &Response) -> Option<&str> {
    response
        .headers()
        .get(CACHE_STATUS_HEADER)
        .and_then(|value| value.to_str().ok())
}

#[tokio::test]
async fn miss_is_captured_and_served_byte_identical_on_hit() {
    let harness = Harness::new(enabled_config());

    let first = harness.get("/about/").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(status_header(&first), Some("miss"));
    let first_body = body_bytes(first).await;

    let key = harness.key("/about/");
    assert!(harness.wait_for_entry(&key).await, "page was not stored");

    let second = harness.get("/about/").await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(status_header(&second), Some("hit"));
    assert_eq!(
        second.headers().get(header::CONTENT_TYPE).expect("content type"),
        "text/html; charset=utf-8"
    );
    assert_eq!(body_bytes(second).await, first_body);
    assert_eq!(harness.calls(), 1);
}

#[tokio::test]
async fn unwritable_cache_root_still_serves_the_origin_response() {
    let harness = Harness::build(
        enabled_config(),
        TenantSet::single(Tenant::new("main", HOST, "")),
        |dir| {
            let blocker = dir.join("blocker");
            std::fs::write(&blocker, b"not a directory").expect("blocker file");
            blocker.join("pages")
        },
    );

    let first = harness.get("/about/").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(
        body_bytes(first).await,
        b"<html><body>/about/ render 1</body></html>"
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.store.read(&harness.key("/about/")).await.is_none());

    let second = harness.get("/about/").await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(status_header(&second), Some("miss"));
    assert_eq!(harness.calls(), 2);
}

#[tokio::test]
async fn page_named_like_an_index_file_does_not_block_the_home_page() {
    let harness = Harness::new(enabled_config());

    harness.get("/index.html").await;
    assert!(harness.wait_for_entry(&harness.key("/index.html")).await);

    harness.get("/").await;
    assert!(harness.wait_for_entry(&harness.key("/")).await, "home page was not stored");
    assert_eq!(status_header(&harness.get("/").await), Some("hit"));
    assert_eq!(status_header(&harness.get("/index.html").await), Some("hit"));
    assert_eq!(harness.calls(), 2);
}

#[tokio::test]
async fn reserved_path_segments_bypass_the_cache() {
    let harness = Harness::new(enabled_config());

    let response = harness.get("/.sitecache-page/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(status_header(&response), None);
    harness.get("/.sitecache-page/").await;
    assert_eq!(harness.calls(), 2);
}

#[tokio::test]
async fn query_string_shares_the_path_entry() {
    let harness = Harness::new(enabled_config());

    harness.get("/news/").await;
    assert!(harness.wait_for_entry(&harness.key("/news/")).await);

    let response = harness.get("/news/?utm_source=feed").await;
    assert_eq!(status_header(&response), Some("hit"));
    assert_eq!(harness.calls(), 1);
}

#[tokio::test]
async fn exception_rule_keeps_path_uncached() {
    let harness = Harness::new(CacheConfig {
        advanced_mode: true,
        cache_exception_urls: vec!["/checkout/*".to_string()],
        ..enabled_config()
    });

    for _ in 0..2 {
        let response = harness.get("/checkout/cart/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(status_header(&response), None);
    }
    assert_eq!(harness.calls(), 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.store.read(&harness.key("/checkout/cart/")).await.is_none());
}

#[tokio::test]
async fn exception_rules_are_ignored_outside_advanced_mode() {
    let harness = Harness::new(CacheConfig {
        advanced_mode: false,
        cache_exception_urls: vec!["/checkout/*".to_string()],
        ..enabled_config()
    });

    let response = harness.get("/checkout/cart/").await;
    assert_eq!(status_header(&response), Some("miss"));
}

#[tokio::test]
async fn authenticated_and_non_get_requests_bypass() {
    let harness = Harness::new(enabled_config());

    let logged_in = Request::builder()
        .uri("/account/")
        .header(header::HOST, HOST)
        .header(header::COOKIE, "wordpress_logged_in_abc=1")
        .body(Body::empty())
        .expect("request");
    let response = harness.send(logged_in).await;
    assert_eq!(status_header(&response), None);

    let post = harness.send(request(Method::POST, HOST, "/account/")).await;
    assert_eq!(status_header(&post), None);

    let feed = harness.get("/feed.xml").await;
    assert_eq!(status_header(&feed), None);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.store.read(&harness.key("/account/")).await.is_none());
    assert_eq!(harness.calls(), 3);
}

#[tokio::test]
async fn recent_commenter_bypasses_only_that_path() {
    let harness = Harness::new(enabled_config());
    let cookie = format!(
        "sitecache_commented_posts={}",
        urlencoding::encode(r#"["/hello-world/"]"#)
    );

    let commented = Request::builder()
        .uri("/hello-world/")
        .header(header::HOST, HOST)
        .header(header::COOKIE, cookie.as_str())
        .body(Body::empty())
        .expect("request");
    assert_eq!(status_header(&harness.send(commented).await), None);

    let other = Request::builder()
        .uri("/other/")
        .header(header::HOST, HOST)
        .header(header::COOKIE, cookie.as_str())
        .body(Body::empty())
        .expect("request");
    assert_eq!(status_header(&harness.send(other).await), Some("miss"));
}

#[tokio::test]
async fn responses_setting_cookies_are_not_stored() {
    let harness = Harness::new(enabled_config());

    let response = harness.get("/session/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(status_header(&response), None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.store.read(&harness.key("/session/")).await.is_none());
}

#[tokio::test]
async fn disabled_caching_passes_through() {
    let harness = Harness::new(CacheConfig::default());

    harness.get("/").await;
    harness.get("/").await;
    assert_eq!(harness.calls(), 2);
}

#[tokio::test]
async fn gzip_variant_served_to_accepting_clients() {
    let harness = Harness::new(CacheConfig {
        enable_gzip_compression: true,
        ..enabled_config()
    });

    let first = body_bytes(harness.get("/docs/").await).await;
    let key = harness.key("/docs/");
    assert!(harness.wait_for_entry(&key).await);
    for _ in 0..100 {
        if harness.store.read_gzip(&key).await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let gzip_request = Request::builder()
        .uri("/docs/")
        .header(header::HOST, HOST)
        .header(header::ACCEPT_ENCODING, "gzip, br")
        .body(Body::empty())
        .expect("request");
    let response = harness.send(gzip_request).await;
    assert_eq!(status_header(&response), Some("hit"));
    assert_eq!(
        response.headers().get(header::CONTENT_ENCODING).expect("encoding"),
        "gzip"
    );
    assert_eq!(
        response.headers().get(header::VARY).expect("vary"),
        "Accept-Encoding"
    );
    let compressed = body_bytes(response).await;
    let mut decoded = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut decoded)
        .expect("gunzip");
    assert_eq!(decoded, first);

    let plain = harness.get("/docs/").await;
    assert!(plain.headers().get(header::CONTENT_ENCODING).is_none());
    assert_eq!(body_bytes(plain).await, first);
}

#[tokio::test]
async fn expired_entries_are_missed_and_swept() {
    let harness = Harness::new(enabled_config());
    let key = harness.key("/old/");
    harness
        .store
        .write(&key, b"<html>old</html>", None)
        .await
        .expect("write");

    let ttl = harness.config.snapshot().ttl();
    assert_eq!(ttl, Duration::from_secs(3600));
    let later = SystemTime::now() + ttl + Duration::from_secs(1);
    assert!(harness.store.lookup(&key, ttl, false, later).await.is_none());
    assert!(harness.store.lookup(&key, ttl, false, SystemTime::now()).await.is_some());

    let sweeper = Sweeper::new(
        Arc::clone(&harness.store),
        harness.config.clone(),
        Arc::clone(&harness.tenants),
    );
    let fresh = sweeper.sweep_at(SystemTime::now()).await;
    assert_eq!(fresh.evicted, 0);
    let report = sweeper.sweep_at(later).await;
    assert_eq!(report.evicted, 1);
    assert!(harness.store.read(&key).await.is_none());
}

#[tokio::test]
async fn settings_change_takes_effect_without_restart() {
    let harness = Harness::new(enabled_config());

    harness.get("/live/").await;
    assert!(harness.wait_for_entry(&harness.key("/live/")).await);
    assert_eq!(status_header(&harness.get("/live/").await), Some("hit"));

    harness.config.replace(CacheConfig {
        advanced_mode: true,
        cache_exception_urls: vec!["/live/".to_string()],
        ..enabled_config()
    });
    assert_eq!(status_header(&harness.get("/live/").await), None);
}

#[derive(Default)]
struct CountingCache {
    flushes: AtomicUsize,
}

#[async_trait]
impl ObjectCache for CountingCache {
    fn backend(&self) -> InMemoryCache {
        InMemoryCache::Redis
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, ObjectCacheError> {
        Ok(None)
    }

    async fn set(
        &self,
        _key: &str,
        _value: &[u8],
        _ttl: Option<Duration>,
    ) -> Result<(), ObjectCacheError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<bool, ObjectCacheError> {
        Ok(false)
    }

    async fn flush(&self) -> Result<(), ObjectCacheError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn network_purge_clears_every_tenant_and_flushes_once() {
    let tenants = TenantSet::network(vec![
        Tenant::new("a", "a.example", ""),
        Tenant::new("b", "b.example", ""),
    ]);
    let harness = Harness::with_tenants(enabled_config(), tenants);

    for host in ["a.example", "b.example"] {
        harness.send(request(Method::GET, host, "/x/")).await;
    }
    let keys: Vec<StorageKey> = harness
        .tenants
        .iter()
        .map(|tenant| resolve(tenant, "/x/"))
        .collect();
    for key in &keys {
        assert!(harness.wait_for_entry(key).await, "missing {key}");
    }

    let counting = Arc::new(CountingCache::default());
    let slot = ObjectCacheSlot::new(Some(counting.clone() as Arc<dyn ObjectCache>));
    let invalidator = Invalidator::new(Arc::clone(&harness.store), slot);

    let report = invalidator.purge_network(harness.tenants.iter()).await;
    assert_eq!(report.entries_removed, 2);
    assert!(report.object_cache_flushed);
    assert!(report.failures.is_empty());
    assert_eq!(counting.flushes.load(Ordering::SeqCst), 1);
    for key in &keys {
        assert!(harness.store.read(key).await.is_none());
    }

    let after = harness.send(request(Method::GET, "a.example", "/x/")).await;
    assert_eq!(status_header(&after), Some("miss"));
}

#[tokio::test]
async fn unknown_host_is_not_cached() {
    let harness = Harness::new(enabled_config());

    let response = harness.send(request(Method::GET, "other.test", "/")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(status_header(&response), None);
}
