//! Identity resolution and organisation switching.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Query, Request, State},
    http::{header, request::Parts, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::AppError;

/// The signed-in user as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub login: String,
    pub org_id: i64,
}

/// Request extension set by the context stage for every request.
#[derive(Debug, Clone, Default)]
pub struct CurrentIdentity(pub Option<Identity>);

impl CurrentIdentity {
    pub fn is_signed_in(&self) -> bool {
        self.0.is_some()
    }
}

/// Resolves the identity behind a request (session cookie, API key, ...).
#[async_trait]
pub trait SessionResolver: Send + Sync + 'static {
    async fn resolve(&self, parts: &Parts) -> Option<Identity>;
}

/// Treats every request as unauthenticated.
pub struct Anonymous;

#[async_trait]
impl SessionResolver for Anonymous {
    async fn resolve(&self, _parts: &Parts) -> Option<Identity> {
        None
    }
}

/// Changes the active organisation of a user.
#[async_trait]
pub trait OrgSwitcher: Send + Sync + 'static {
    /// Returns false when the user is not a member of `org_id`.
    async fn switch(&self, identity: &Identity, org_id: i64) -> bool;
}

pub async fn context_layer(
    State(resolver): State<Arc<dyn SessionResolver>>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let identity = resolver.resolve(&parts).await;
    if let Some(identity) = &identity {
        tracing::trace!(user_id = identity.user_id, org_id = identity.org_id, "Resolved identity");
    }
    parts.extensions.insert(CurrentIdentity(identity));
    next.run(Request::from_parts(parts, body)).await
}

#[derive(Clone)]
pub struct OrgRedirect {
    switcher: Arc<dyn OrgSwitcher>,
    app_sub_url: Arc<str>,
}

impl OrgRedirect {
    pub fn new(switcher: Arc<dyn OrgSwitcher>, app_sub_url: &str) -> Self {
        Self {
            switcher,
            app_sub_url: Arc::from(app_sub_url),
        }
    }
}

/// Switches the signed-in user to the `orgId` in the query string, then
/// reloads the same URL.
pub async fn org_redirect_layer(
    State(redirect): State<OrgRedirect>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let Some(org_id) = requested_org(&request) else {
        return next.run(request).await;
    };
    let identity = match request.extensions().get::<CurrentIdentity>() {
        Some(CurrentIdentity(Some(identity))) if identity.org_id != org_id => identity.clone(),
        _ => return next.run(request).await,
    };

    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    if !redirect.switcher.switch(&identity, org_id).await {
        tracing::debug!(user_id = identity.user_id, org_id, "Organisation switch refused");
        if path.starts_with("/api") {
            return AppError::NotFound { api: true }.into_response();
        }
        return (StatusCode::NOT_FOUND, format!("GET {} not found", path)).into_response();
    }

    let location = match query {
        Some(query) => format!("{}{}?{}", redirect.app_sub_url, path, query),
        None => format!("{}{}", redirect.app_sub_url, path),
    };
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

fn requested_org(request: &Request) -> Option<i64> {
    let Query(params) = Query::<HashMap<String, String>>::try_from_uri(request.uri()).ok()?;
    params.get("orgId")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::Extension;
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    struct FixedUser;

    #[async_trait]
    impl SessionResolver for FixedUser {
        async fn resolve(&self, parts: &Parts) -> Option<Identity> {
            parts.headers.contains_key("x-test-user").then(|| Identity {
                user_id: 7,
                login: "admin".to_string(),
                org_id: 1,
            })
        }
    }

    struct MemberOf(i64);

    #[async_trait]
    impl OrgSwitcher for MemberOf {
        async fn switch(&self, _identity: &Identity, org_id: i64) -> bool {
            org_id == self.0
        }
    }

    fn app() -> Router {
        let resolver: Arc<dyn SessionResolver> = Arc::new(FixedUser);
        let redirect = OrgRedirect::new(Arc::new(MemberOf(2)), "/portico");
        Router::new()
            .route(
                "/d/home",
                get(|Extension(current): Extension<CurrentIdentity>| async move {
                    current.is_signed_in().to_string()
                }),
            )
            .layer(from_fn_with_state(redirect, org_redirect_layer))
            .layer(from_fn_with_state(resolver, context_layer))
    }

    fn signed_in(uri: &str) -> Request {
        Request::builder()
            .uri(uri)
            .header("x-test-user", "1")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_identity_is_attached() {
        let response = app().oneshot(signed_in("/d/home")).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"true");

        let response = app()
            .oneshot(Request::builder().uri("/d/home").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"false");
    }

    #[tokio::test]
    async fn test_switching_org_redirects_to_same_url() {
        let response = app().oneshot(signed_in("/d/home?orgId=2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "/portico/d/home?orgId=2"
        );
    }

    #[tokio::test]
    async fn test_current_org_passes_through() {
        let response = app().oneshot(signed_in("/d/home?orgId=1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_refused_switch_is_not_found() {
        let response = app().oneshot(signed_in("/d/home?orgId=9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
