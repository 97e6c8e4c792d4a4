//! Static origin: serves the pages the cache sits in front of.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use tokio::fs;

use crate::application::error::HttpError;

const INDEX_FILE: &str = "index.html";

#[derive(Clone)]
pub struct OriginState {
    document_root: Arc<PathBuf>,
}

impl OriginState {
    pub fn new(document_root: impl Into<PathBuf>) -> Self {
        Self {
            document_root: Arc::new(document_root.into()),
        }
    }
}

pub(super) async fn serve_document(
    State(origin): State<OriginState>,
    method: Method,
    uri: Uri,
) -> Response {
    if method != Method::GET && method != Method::HEAD {
        let mut response = StatusCode::METHOD_NOT_ALLOWED.into_response();
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
        return response;
    }

    let Some(path) = document_path(&origin.document_root, uri.path()) else {
        return not_found(uri.path());
    };

    let path = match fs::metadata(&path).await {
        Ok(metadata) if metadata.is_dir() => path.join(INDEX_FILE),
        Ok(_) => path,
        Err(_) => return not_found(uri.path()),
    };

    match fs::read(&path).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&path).first_or(mime_guess::mime::TEXT_HTML_UTF_8);
            let body = if method == Method::HEAD {
                Body::empty()
            } else {
                Body::from(bytes)
            };
            let mut response = Response::new(body);
            if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            response
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => not_found(uri.path()),
        Err(err) => HttpError::new(
            "infra::http::origin::serve_document",
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
            format!("failed to read `{}`: {err}", path.display()),
        )
        .into_response(),
    }
}

fn not_found(path: &str) -> Response {
    HttpError::new(
        "infra::http::origin::serve_document",
        StatusCode::NOT_FOUND,
        "Not found",
        format!("no document for `{path}`"),
    )
    .into_response()
}

/// Maps a URL path below `root`, refusing anything that would climb out.
fn document_path(root: &Path, url_path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(url_path).ok()?;
    let mut path = root.to_path_buf();
    for segment in decoded.split('/').filter(|segment| !segment.is_empty()) {
        if segment == "." || segment == ".." || segment.contains(['\\', '\0']) {
            return None;
        }
        path.push(segment);
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_path_stays_under_root() {
        let root = Path::new("/srv/site");
        assert_eq!(
            document_path(root, "/blog/post/"),
            Some(PathBuf::from("/srv/site/blog/post"))
        );
        assert_eq!(document_path(root, "/"), Some(PathBuf::from("/srv/site")));
        assert_eq!(document_path(root, "/../etc/passwd"), None);
        assert_eq!(document_path(root, "/%2e%2e/etc"), None);
    }
}
