//! Request correlation, logging and rewriting stages.
//!
//! `request_id_layer` is the outermost stage: it opens the span every other
//! log line of the request is emitted under. `logging_layer` sits directly
//! inside it and records the request metrics.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::{header::HeaderValue, uri::PathAndQuery, Uri},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::REQUEST_ID_HEADER;
use crate::state::PipelineState;
use crate::templates::ViewRenderer;

/// Correlation id of the current request.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Longest inbound request id that is trusted
const MAX_REQUEST_ID_LEN: usize = 128;

/// Reuses a well-formed inbound `X-Request-Id`, otherwise generates one.
fn request_id_for(request: &Request) -> String {
    request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| {
            !id.is_empty()
                && id.len() <= MAX_REQUEST_ID_LEN
                && id
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Opens the request span and echoes the request id on the response.
pub async fn request_id_layer(mut request: Request, next: Next) -> Response {
    let request_id = request_id_for(&request);

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    async move {
        let mut response = next.run(request).await;
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
    .instrument(span)
    .await
}

/// Logs completed requests and records them in the metrics registry.
///
/// Server errors are always logged; everything else only when router logging
/// is enabled.
pub async fn logging_layer(
    State(state): State<PipelineState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let elapsed = start.elapsed();
    let status = response.status();
    state
        .metrics
        .record_request(method.as_str(), status.as_u16(), elapsed);

    let duration_ms = elapsed.as_millis() as u64;
    if status.is_server_error() {
        tracing::error!(status = status.as_u16(), duration_ms, "Request completed");
    } else if state.config.server.router_logging {
        tracing::info!(status = status.as_u16(), duration_ms, "Request completed");
    } else {
        tracing::debug!(status = status.as_u16(), duration_ms, "Request completed");
    }

    response
}

/// Strips the configured sub path so routes match as if mounted at `/`.
///
/// Requests outside the sub path pass through untouched.
pub async fn sub_path_layer(
    State(prefix): State<Arc<str>>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(uri) = strip_sub_path(request.uri(), &prefix) {
        *request.uri_mut() = uri;
    }
    next.run(request).await
}

fn strip_sub_path(uri: &Uri, prefix: &str) -> Option<Uri> {
    let rest = uri.path().strip_prefix(prefix)?;
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    let path = if rest.is_empty() { "/" } else { rest };
    let path_and_query = match uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query).ok()?);
    Uri::from_parts(parts).ok()
}

/// Makes the view renderer available to everything further down.
pub async fn views_layer(
    State(views): State<ViewRenderer>,
    mut request: Request,
    next: Next,
) -> Response {
    request.extensions_mut().insert(views);
    next.run(request).await
}
