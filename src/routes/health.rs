//! Liveness interceptors for container orchestration and monitoring.
//!
//! These run as pipeline stages ahead of identity resolution and access
//! control, so they keep answering when authentication or persistence is
//! broken. Each one only claims its exact path and methods; every other
//! request passes through untouched.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;

use crate::config::{API_HEALTH_PATH, HEALTHZ_BODY, HEALTHZ_PATH, METRICS_PATH};
use crate::state::PipelineState;

const JSON_UTF8: &str = "application/json; charset=UTF-8";
const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

fn is_get_or_head(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

/// `GET|HEAD /healthz` answers `Ok` while the process can serve HTTP.
pub async fn healthz(request: Request, next: Next) -> Response {
    if !is_get_or_head(request.method()) || request.uri().path() != HEALTHZ_PATH {
        return next.run(request).await;
    }
    (StatusCode::OK, HEALTHZ_BODY).into_response()
}

#[derive(Debug, Serialize)]
struct HealthReport<'a> {
    database: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    commit: Option<&'a str>,
}

/// `GET|HEAD /api/health` reports whether persistence is reachable.
///
/// A failing database is reported with a 503, never as an error.
pub async fn api_health(
    State(state): State<PipelineState>,
    request: Request,
    next: Next,
) -> Response {
    if !is_get_or_head(request.method()) || request.uri().path() != API_HEALTH_PATH {
        return next.run(request).await;
    }

    let healthy = state.database_healthy().await;
    let show_version = !state.config.health.hide_version;
    let report = HealthReport {
        database: if healthy { "ok" } else { "failing" },
        version: show_version.then_some(state.build.version.as_str()),
        commit: show_version.then_some(state.build.commit.as_str()),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    match serde_json::to_vec_pretty(&report) {
        Ok(body) => (status, [(header::CONTENT_TYPE, JSON_UTF8)], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode health report");
            status.into_response()
        }
    }
}

/// `GET /metrics` renders the Prometheus exposition, behind Basic auth when
/// credentials are configured.
pub async fn metrics_endpoint(
    State(state): State<PipelineState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::GET || request.uri().path() != METRICS_PATH {
        return next.run(request).await;
    }

    let metrics_config = &state.config.metrics;
    if metrics_config.basic_auth_enabled()
        && !basic_auth_matches(
            request.headers(),
            &metrics_config.basic_auth_username,
            &metrics_config.basic_auth_password,
        )
    {
        return Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::UNAUTHORIZED.into_response());
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_TEXT)],
        state.metrics.render(),
    )
        .into_response()
}

fn basic_auth_matches(headers: &HeaderMap, username: &str, password: &str) -> bool {
    let Some(encoded) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return false;
    };

    // Evaluate both so timing does not reveal which one differed
    let user_ok = constant_time_eq(user.as_bytes(), username.as_bytes());
    let pass_ok = constant_time_eq(pass.as_bytes(), password.as_bytes());
    user_ok & pass_ok
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}
