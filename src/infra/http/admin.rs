//! Admin listener: purge, settings, health, and deactivation.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{HeaderMap, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::application::{
    admin_auth::{AdminAuth, AdminAuthError},
    error::{AppError, HttpError},
    settings::{CacheSettingsService, PurgeScope},
};
use crate::cache::{AccessProblem, CacheConfig, PurgeReport};

use super::middleware::{log_responses, set_request_context};

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Clone)]
pub struct AdminState {
    pub settings: Arc<CacheSettingsService>,
    pub auth: AdminAuth,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(admin_health))
        .route("/cache/purge", post(admin_purge))
        .route("/settings", get(admin_settings).put(admin_update_settings))
        .route("/deactivate", post(admin_deactivate))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
        .with_state(state)
}

async fn admin_auth(State(state): State<AdminState>, request: Request<Body>, next: Next) -> Response {
    let token = bearer_token(request.headers());
    match state.auth.authenticate(token.as_deref()) {
        Ok(()) => next.run(request).await,
        Err(AdminAuthError::Disabled) => HttpError::new(
            "infra::http::admin::auth",
            StatusCode::FORBIDDEN,
            "Admin API disabled",
            "no admin token configured",
        )
        .into_response(),
        Err(err @ (AdminAuthError::Missing | AdminAuthError::Invalid)) => {
            let mut response = HttpError::new(
                "infra::http::admin::auth",
                StatusCode::UNAUTHORIZED,
                "Admin token required",
                err.to_string(),
            )
            .into_response();
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static("Bearer"),
            );
            response
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .or_else(|| {
            headers
                .get(ADMIN_TOKEN_HEADER)
                .and_then(|value| value.to_str().ok())
        })
        .map(str::to_string)
}

#[derive(Debug, Serialize)]
struct HealthReport {
    page_caching: bool,
    access_problems: Vec<AccessProblem>,
    sweep_interval_secs: Option<u64>,
    object_cache: Option<String>,
}

async fn admin_health(State(state): State<AdminState>) -> Response {
    let access_problems = state.settings.check_access().await;
    let report = HealthReport {
        page_caching: state.settings.current().enable_page_caching,
        sweep_interval_secs: state
            .settings
            .scheduler()
            .current_interval()
            .map(|interval| interval.as_secs()),
        object_cache: state
            .settings
            .object_cache()
            .current()
            .map(|cache| cache.backend().to_string()),
        access_problems,
    };
    let status = if report.access_problems.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

#[derive(Debug, Default, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ScopeParam {
    #[default]
    Site,
    Network,
}

#[derive(Debug, Default, Deserialize)]
struct PurgeParams {
    scope: Option<ScopeParam>,
    tenant: Option<String>,
}

impl PurgeParams {
    /// Fields given in the body take precedence over the query string.
    fn merged(self, body: &[u8]) -> Result<Self, AppError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(self);
        }
        let from_body: PurgeParams = serde_json::from_slice(body)
            .map_err(|err| AppError::validation(format!("invalid purge body: {err}")))?;
        Ok(Self {
            scope: from_body.scope.or(self.scope),
            tenant: from_body.tenant.or(self.tenant),
        })
    }
}

async fn admin_purge(
    State(state): State<AdminState>,
    Query(query): Query<PurgeParams>,
    body: Bytes,
) -> Result<Json<PurgeReport>, AppError> {
    let params = query.merged(&body)?;
    let scope = match params.scope.unwrap_or_default() {
        ScopeParam::Network if params.tenant.is_some() => {
            return Err(AppError::validation(
                "`tenant` cannot be combined with scope=network",
            ));
        }
        ScopeParam::Network => PurgeScope::Network,
        ScopeParam::Site => PurgeScope::Site(params.tenant),
    };

    let report = state.settings.purge(scope).await?;
    info!(
        target = "sitecache::admin::purge",
        tenants = report.tenants.len(),
        removed = report.entries_removed,
        "Purge requested via admin API"
    );
    Ok(Json(report))
}

async fn admin_settings(State(state): State<AdminState>) -> Json<CacheConfig> {
    Json(state.settings.current())
}

async fn admin_update_settings(
    State(state): State<AdminState>,
    Json(next): Json<CacheConfig>,
) -> Result<Response, AppError> {
    let outcome = state.settings.update(next).await?;
    if !outcome.applied {
        warn!(
            target = "sitecache::admin::settings",
            problems = outcome.access_problems.len(),
            "Settings rejected: cache directory not writable"
        );
        return Ok((StatusCode::CONFLICT, Json(outcome)).into_response());
    }
    Ok(Json(outcome).into_response())
}

async fn admin_deactivate(State(state): State<AdminState>) -> Result<Json<PurgeReport>, AppError> {
    let report = state.settings.deactivate().await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_wins_over_custom_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(ADMIN_TOKEN_HEADER, HeaderValue::from_static("xyz"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));
    }

    #[test]
    fn purge_body_overrides_query() {
        let query = PurgeParams {
            scope: Some(ScopeParam::Site),
            tenant: Some("a".into()),
        };
        let merged = query.merged(br#"{"tenant":"b"}"#).expect("merge");
        assert_eq!(merged.scope, Some(ScopeParam::Site));
        assert_eq!(merged.tenant.as_deref(), Some("b"));

        let merged = PurgeParams::default().merged(b"  ").expect("empty body");
        assert!(merged.scope.is_none() && merged.tenant.is_none());

        assert!(PurgeParams::default().merged(b"scope=network").is_err());
    }

    #[test]
    fn custom_header_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_TOKEN_HEADER, HeaderValue::from_static("xyz"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("xyz"));
    }

    #[test]
    fn non_bearer_authorization_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }
}
