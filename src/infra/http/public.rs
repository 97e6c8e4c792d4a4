use axum::{Router, middleware};

use crate::cache::{PageCacheState, page_cache_layer};

use super::middleware::{log_responses, set_request_context};
use super::origin::{OriginState, serve_document};

/// Public listener: the document origin behind the page cache.
pub fn build_public_router(cache: PageCacheState, origin: OriginState) -> Router {
    Router::new()
        .fallback(serve_document)
        .with_state(origin)
        .layer(middleware::from_fn_with_state(cache, page_cache_layer))
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}
