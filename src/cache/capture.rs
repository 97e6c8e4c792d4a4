//! Write-through capture of origin responses.
//!
//! On a miss the middleware buffers the generated body, hands the visitor
//! the exact same bytes, and stores them in the background. A failed store
//! is logged and dropped; the next miss tries again.

use std::io::{self, Write};
use std::sync::Arc;

use axum::body::{Body, HttpBody};
use axum::http::header;
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use metrics::counter;
use tracing::{debug, warn};

use super::config::ActiveConfig;
use super::keys::StorageKey;
use super::store::PageStore;

const METRIC_PAGE_STORE: &str = "sitecache_page_store_total";
const METRIC_PAGE_STORE_FAILED: &str = "sitecache_page_store_failed_total";

/// Bodies larger than this are passed through without being stored.
pub const MAX_CAPTURE_BYTES: usize = 8 * 1024 * 1024;

/// Ties a response being generated to the key it will be stored under.
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    key: StorageKey,
    compress: bool,
}

impl CaptureHandle {
    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    pub fn compress(&self) -> bool {
        self.compress
    }
}

/// Starts a capture for `key` under the given config snapshot.
pub fn attach(key: StorageKey, config: &ActiveConfig) -> CaptureHandle {
    CaptureHandle {
        key,
        compress: config.compression_enabled(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Stored,
    Skipped,
    Failed,
}

/// Persists the captured bytes, with a gzip variant when compression is on.
pub async fn finalize(store: &PageStore, handle: CaptureHandle, body: Bytes) -> CaptureOutcome {
    if body.is_empty() {
        debug!(
            target = "sitecache::cache::capture",
            key = %handle.key,
            "Skipping capture of empty body"
        );
        return CaptureOutcome::Skipped;
    }

    let compressed = if handle.compress {
        let raw = body.clone();
        match tokio::task::spawn_blocking(move || gzip(&raw)).await {
            Ok(Ok(compressed)) => Some(compressed),
            Ok(Err(err)) => {
                warn!(
                    target = "sitecache::cache::capture",
                    key = %handle.key,
                    error = %err,
                    "Compression failed; storing uncompressed page only"
                );
                None
            }
            Err(err) => {
                warn!(
                    target = "sitecache::cache::capture",
                    key = %handle.key,
                    error = %err,
                    "Compression task aborted; storing uncompressed page only"
                );
                None
            }
        }
    } else {
        None
    };

    match store.write(&handle.key, &body, compressed.as_deref()).await {
        Ok(()) => {
            counter!(METRIC_PAGE_STORE).increment(1);
            debug!(
                target = "sitecache::cache::capture",
                key = %handle.key,
                bytes = body.len(),
                gzip = compressed.is_some(),
                "Stored page"
            );
            CaptureOutcome::Stored
        }
        Err(err) => {
            counter!(METRIC_PAGE_STORE_FAILED).increment(1);
            warn!(
                target = "sitecache::cache::capture",
                key = %handle.key,
                error = %err,
                "Failed to store page"
            );
            CaptureOutcome::Failed
        }
    }
}

/// Gzip-compresses `bytes` at the default level.
pub fn gzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Only complete, anonymous, non-streaming 200 responses are captured.
pub fn should_capture(response: &Response) -> bool {
    if response.status() != axum::http::StatusCode::OK {
        return false;
    }

    let headers = response.headers();
    if headers.contains_key(header::SET_COOKIE) || headers.contains_key(header::CONTENT_ENCODING) {
        return false;
    }

    if headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return false;
    }

    true
}

/// Collects the body, returning a rebuilt response carrying the same bytes.
/// `Err` carries a response that must be sent without being captured.
pub async fn buffer_response(response: Response) -> Result<(Response, Bytes), Response> {
    buffer_response_limited(response, MAX_CAPTURE_BYTES).await
}

pub async fn buffer_response_limited(
    response: Response,
    limit: usize,
) -> Result<(Response, Bytes), Response> {
    let (parts, mut body) = response.into_parts();
    if body.size_hint().lower() > limit as u64 {
        debug!(
            target = "sitecache::cache::capture",
            limit,
            "Origin body too large to capture"
        );
        return Err(Response::from_parts(parts, body));
    }

    let mut buffered = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    target = "sitecache::cache::capture",
                    error = %err,
                    "Failed to buffer origin response"
                );
                return Err(Response::from_parts(parts, Body::empty()));
            }
        };
        let Ok(chunk) = frame.into_data() else {
            continue;
        };
        if buffered.len() + chunk.len() > limit {
            debug!(
                target = "sitecache::cache::capture",
                limit,
                "Origin body too large to capture"
            );
            let head = stream::iter([Ok::<_, axum::Error>(buffered.freeze()), Ok(chunk)]);
            let body = Body::from_stream(head.chain(body.into_data_stream()));
            return Err(Response::from_parts(parts, body));
        }
        buffered.extend_from_slice(&chunk);
    }

    let bytes = buffered.freeze();
    Ok((Response::from_parts(parts, Body::from(bytes.clone())), bytes))
}

/// Runs [`finalize`] on its own task so the visitor never waits on disk.
pub fn spawn_finalize(store: Arc<PageStore>, handle: CaptureHandle, body: Bytes) {
    tokio::spawn(async move {
        finalize(&store, handle, body).await;
    });
}
