//! Page cache middleware.
//!
//! Sits in front of the origin. Cacheable requests with a fresh entry are
//! answered from disk; misses run the origin and capture its output.

use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use metrics::counter;
use tracing::{debug, instrument};

use super::capture::{self, buffer_response, should_capture};
use super::config::ConfigHandle;
use super::gate::{CacheRequest, Classification, CookiePolicy, classify};
use super::keys::{TenantSet, resolve};
use super::store::{Encoding, PageStore, StoredPage};

const METRIC_PAGE_HIT: &str = "sitecache_page_hit_total";
const METRIC_PAGE_MISS: &str = "sitecache_page_miss_total";
const METRIC_PAGE_BYPASS: &str = "sitecache_page_bypass_total";

pub const CACHE_STATUS_HEADER: &str = "x-sitecache";
const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Shared state for [`page_cache_layer`].
#[derive(Clone)]
pub struct PageCacheState {
    pub config: ConfigHandle,
    pub store: Arc<PageStore>,
    pub tenants: Arc<TenantSet>,
    pub cookies: Arc<CookiePolicy>,
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(cache): State<PageCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let config = cache.config.snapshot();
    if !config.page_caching_enabled() {
        return next.run(request).await;
    }

    let view = CacheRequest::from_request(&request);
    if let Classification::NotCacheable(reason) = classify(&view, &config, &cache.cookies) {
        counter!(METRIC_PAGE_BYPASS, "reason" => reason.as_str()).increment(1);
        debug!(
            cache = "page",
            outcome = "bypass",
            reason = reason.as_str(),
            "bypassing page cache"
        );
        return next.run(request).await;
    }

    let Some((tenant, relative)) = cache.tenants.match_request(view.host(), view.path()) else {
        counter!(METRIC_PAGE_BYPASS, "reason" => "unknown_tenant").increment(1);
        debug!(
            cache = "page",
            outcome = "bypass",
            host = view.host(),
            "no tenant for host"
        );
        return next.run(request).await;
    };
    let key = resolve(tenant, relative);
    if !key.is_safe() {
        counter!(METRIC_PAGE_BYPASS, "reason" => "unsafe_key").increment(1);
        return next.run(request).await;
    }

    let prefer_gzip = config.compression_enabled() && accepts_gzip(request.headers());
    if let Some(page) = cache
        .store
        .lookup(&key, config.ttl(), prefer_gzip, SystemTime::now())
        .await
    {
        counter!(METRIC_PAGE_HIT).increment(1);
        debug!(cache = "page", outcome = "hit", key = %key, "serving cached page");
        return hit_response(page, view.path(), config.compression_enabled());
    }

    counter!(METRIC_PAGE_MISS).increment(1);
    debug!(cache = "page", outcome = "miss", key = %key, "cache miss, running origin");

    let handle = capture::attach(key, &config);
    let response = next.run(request).await;
    if !should_capture(&response) {
        return response;
    }

    match buffer_response(response).await {
        Ok((mut response, bytes)) => {
            capture::spawn_finalize(Arc::clone(&cache.store), handle, bytes);
            response
                .headers_mut()
                .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("miss"));
            response
        }
        Err(response) => response,
    }
}

fn hit_response(page: StoredPage, path: &str, compression_enabled: bool) -> Response {
    let mut response = Response::new(Body::from(page.body));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type_for(path));
    headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static("hit"));
    if page.encoding == Encoding::Gzip {
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    if compression_enabled {
        headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
    }
    response
}

fn content_type_for(path: &str) -> HeaderValue {
    let last = path.rsplit('/').next().unwrap_or_default();
    if !last.contains('.') {
        return HeaderValue::from_static(DEFAULT_CONTENT_TYPE);
    }
    mime_guess::from_path(last)
        .first()
        .and_then(|mime| HeaderValue::from_str(mime.as_ref()).ok())
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE))
}

/// True when the client lists `gzip` (or `*`) with a non-zero quality.
fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| {
            let mut parts = item.split(';');
            let coding = parts.next().unwrap_or_default().trim();
            if !coding.eq_ignore_ascii_case("gzip") && coding != "*" {
                return false;
            }
            parts
                .filter_map(|param| param.trim().strip_prefix("q="))
                .all(|q| q.trim().parse::<f32>().unwrap_or(1.0) > 0.0)
        })
}
