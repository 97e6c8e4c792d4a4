use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderValue, Method, Request, StatusCode, Uri},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;
use crate::cache::CACHE_STATUS_HEADER;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request identifiers, shared between request and response extensions.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

/// Tags the request with an id, honouring one set by an upstream proxy.
pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
    let ctx = RequestContext { request_id };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

struct RequestLine {
    method: Method,
    uri: Uri,
    request_id: String,
    started_at: Instant,
}

/// Logs every response at debug, and failures with their error chain.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let line = RequestLine {
        method: request.method().clone(),
        uri: request.uri().clone(),
        request_id: request
            .extensions()
            .get::<RequestContext>()
            .map(|ctx| ctx.request_id.clone())
            .unwrap_or_default(),
        started_at: Instant::now(),
    };

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = line.started_at.elapsed().as_millis();

    if status.is_client_error() || status.is_server_error() {
        let report = response.extensions_mut().remove::<ErrorReport>();
        log_failure(&line, status, elapsed_ms, report);
        return response;
    }

    let cache = response
        .headers()
        .get(CACHE_STATUS_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("none");
    debug!(
        target = "sitecache::http::response",
        status = status.as_u16(),
        method = %line.method,
        path = %line.uri.path(),
        elapsed_ms = elapsed_ms,
        cache = cache,
        request_id = line.request_id,
        "request served",
    );
    response
}

fn log_failure(
    line: &RequestLine,
    status: StatusCode,
    elapsed_ms: u128,
    report: Option<ErrorReport>,
) {
    let (source, messages) = report
        .map(|report| (report.source, report.messages))
        .unwrap_or(("unknown", Vec::new()));
    let detail = messages
        .first()
        .map_or("no diagnostic available", String::as_str);

    if status.is_server_error() {
        error!(
            target = "sitecache::http::response",
            status = status.as_u16(),
            method = %line.method,
            path = %line.uri.path(),
            query = line.uri.query().unwrap_or(""),
            elapsed_ms = elapsed_ms,
            source = source,
            detail = %detail,
            chain = ?messages,
            request_id = line.request_id,
            "request failed",
        );
    } else {
        warn!(
            target = "sitecache::http::response",
            status = status.as_u16(),
            method = %line.method,
            path = %line.uri.path(),
            elapsed_ms = elapsed_ms,
            source = source,
            detail = %detail,
            request_id = line.request_id,
            "client request error",
        );
    }
}
