//! Response header policy and header-driven request stages.

use std::sync::Arc;

use axum::{
    extract::{OriginalUri, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    Router,
};
use axum_extra::extract::Host;
use base64::{engine::general_purpose::STANDARD, Engine};
use uuid::Uuid;

use crate::config::{HttpSettings, ServerConfig, NO_CACHE_HEADER};
use crate::error::ServerError;

/// Security headers added to every response, static assets included.
#[derive(Debug, Clone)]
pub struct ResponseHeaderPolicy {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl ResponseHeaderPolicy {
    pub fn from_config(config: &ServerConfig, tls: bool) -> Self {
        let security = &config.security;
        let mut headers = Vec::new();

        if !security.allow_embedding {
            headers.push((header::X_FRAME_OPTIONS, HeaderValue::from_static("deny")));
        }
        if security.content_type_protection {
            headers.push((
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            ));
        }
        if security.x_xss_protection {
            headers.push((
                header::X_XSS_PROTECTION,
                HeaderValue::from_static("1; mode=block"),
            ));
        }
        if tls && security.strict_transport_security {
            let value = format!("max-age={}", security.strict_transport_security_max_age);
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.push((header::STRICT_TRANSPORT_SECURITY, value));
            }
        }

        Self { headers }
    }

    /// Adds the policy headers without overriding ones the handler set.
    pub fn apply(&self, target: &mut HeaderMap) {
        for (name, value) in &self.headers {
            if !target.contains_key(name) {
                target.insert(name.clone(), value.clone());
            }
        }
    }
}

/// Applies the security headers and marks dynamic responses uncacheable.
pub fn default_headers_layer(router: Router, policy: Arc<ResponseHeaderPolicy>) -> Router {
    router.layer(from_fn_with_state(policy, default_headers))
}

async fn default_headers(
    State(policy): State<Arc<ResponseHeaderPolicy>>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    if !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(header::EXPIRES, HeaderValue::from_static("-1"));
    }
    policy.apply(headers);

    response
}

/// Set when the client asked to bypass server-side caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipCache(pub bool);

pub async fn no_cache_flag_layer(mut request: Request, next: Next) -> Response {
    let skip = request
        .headers()
        .get(NO_CACHE_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    request.extensions_mut().insert(SkipCache(skip));
    next.run(request).await
}

/// Per-request nonce for inline scripts in rendered views.
#[derive(Debug, Clone)]
pub struct CspNonce(pub String);

/// Content security policy with `$ROOT_PATH` already substituted.
#[derive(Debug)]
pub struct CspTemplate {
    template: String,
}

impl CspTemplate {
    /// Fails when the template cannot become a header value.
    pub fn new(template: &str, app_sub_url: &str) -> Result<Self, ServerError> {
        let template = template.replace("$ROOT_PATH", app_sub_url);
        HeaderValue::from_str(&template.replace("$NONCE", "")).map_err(|_| {
            ServerError::Configuration(
                "content_security_policy_template is not a valid header value".to_string(),
            )
        })?;
        Ok(Self { template })
    }

    pub fn render(&self, nonce: &str) -> String {
        self.template
            .replace("$NONCE", &format!("'nonce-{}'", nonce))
    }
}

pub async fn csp_layer(
    State(csp): State<Arc<CspTemplate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let nonce = STANDARD.encode(Uuid::new_v4().as_bytes());
    let policy = csp.render(&nonce);
    request.extensions_mut().insert(CspNonce(nonce));

    let mut response = next.run(request).await;
    match HeaderValue::from_str(&policy) {
        Ok(value) => {
            response
                .headers_mut()
                .insert(header::CONTENT_SECURITY_POLICY, value);
        }
        Err(e) => tracing::error!(error = %e, "Invalid content security policy header"),
    }
    response
}

/// Domain requests must use, and where to send them otherwise.
#[derive(Debug)]
pub struct CanonicalHost {
    domain: String,
    origin: String,
}

impl CanonicalHost {
    pub fn from_settings(settings: &HttpSettings) -> Self {
        let root = settings.root_url();
        // The original request URI still carries the sub path
        let origin = root
            .strip_suffix(settings.app_sub_url.as_str())
            .unwrap_or(&root)
            .to_string();
        Self {
            domain: settings.domain.clone(),
            origin,
        }
    }

    fn matches(&self, host: &str) -> bool {
        strip_port(host).eq_ignore_ascii_case(&self.domain)
    }
}

/// `host[:port]` or `[v6]:port` without the port
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Redirects requests for any host other than the configured domain.
pub async fn validate_host_layer(
    State(canonical): State<Arc<CanonicalHost>>,
    host: Option<Host>,
    request: Request,
    next: Next,
) -> Response {
    // A request without any host is redirected like a foreign one
    let host = host.map(|Host(host)| host).unwrap_or_default();
    if canonical.matches(&host) {
        return next.run(request).await;
    }

    let uri = request
        .extensions()
        .get::<OriginalUri>()
        .map(|original| original.0.clone())
        .unwrap_or_else(|| request.uri().clone());
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("{}{}", canonical.origin, path);

    tracing::debug!(host = %host, location = %location, "Redirecting to canonical domain");
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, location)],
    )
        .into_response()
}
