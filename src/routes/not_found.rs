//! Terminal handler for requests no route claimed.

use axum::{
    extract::Request,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::config::INDEX_TEMPLATE;
use crate::error::AppError;
use crate::middleware::context::CurrentIdentity;
use crate::middleware::headers::CspNonce;
use crate::templates::ViewRenderer;

fn is_api(path: &str) -> bool {
    path == "/api" || path.starts_with("/api/")
}

/// Requires a signed-in user, then answers 404.
///
/// Browsers get the application shell with a 404 status so the client-side
/// router can render its own page.
pub async fn not_found(request: Request) -> Response {
    let path = request.uri().path();
    let api = is_api(path);
    let signed_in = request
        .extensions()
        .get::<CurrentIdentity>()
        .is_some_and(CurrentIdentity::is_signed_in);

    if !signed_in {
        if api {
            return AppError::Unauthorized.into_response();
        }
        let login = match request.extensions().get::<ViewRenderer>() {
            Some(views) => format!("{}/login", views.app_sub_url()),
            None => "/login".to_string(),
        };
        return (StatusCode::FOUND, [(header::LOCATION, login)]).into_response();
    }

    if api {
        return AppError::NotFound { api: true }.into_response();
    }

    let Some(views) = request.extensions().get::<ViewRenderer>() else {
        return AppError::NotFound { api: false }.into_response();
    };
    if !views.has_template(INDEX_TEMPLATE) {
        return AppError::NotFound { api: false }.into_response();
    }

    let nonce = request.extensions().get::<CspNonce>().map(|n| n.0.as_str());
    match views.render(INDEX_TEMPLATE, &tera::Context::new(), nonce) {
        Ok(html) => (StatusCode::NOT_FOUND, html).into_response(),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    use crate::middleware::context::Identity;

    fn request(path: &str, signed_in: bool, views: Option<ViewRenderer>) -> Request {
        let mut request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let identity = signed_in.then(|| Identity {
            user_id: 1,
            login: "admin".to_string(),
            org_id: 1,
        });
        request.extensions_mut().insert(CurrentIdentity(identity));
        if let Some(views) = views {
            request.extensions_mut().insert(views);
        }
        request
    }

    fn app() -> Router {
        Router::new()
            .route("/known", get(|| async { "known" }))
            .fallback(not_found)
    }

    #[tokio::test]
    async fn test_anonymous_api_request_is_unauthorized() {
        let response = app().oneshot(request("/api/nope", false, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_anonymous_browser_request_goes_to_login() {
        let dir = tempfile::tempdir().unwrap();
        let views = ViewRenderer::load(dir.path(), "/portico").unwrap();

        let response = app()
            .oneshot(request("/nope", false, Some(views)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/portico/login");
    }

    #[tokio::test]
    async fn test_signed_in_api_request_is_json_404() {
        let response = app().oneshot(request("/api/nope", true, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["message"], "Not found");
    }

    #[tokio::test]
    async fn test_signed_in_browser_request_renders_shell() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<div id=\"app\"></div>").unwrap();
        let views = ViewRenderer::load(dir.path(), "").unwrap();

        let response = app()
            .oneshot(request("/dashboards/unknown", true, Some(views)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&body).contains("id=\"app\""));
    }

    #[tokio::test]
    async fn test_known_routes_are_unaffected() {
        let response = app().oneshot(request("/known", false, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
