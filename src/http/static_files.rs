//! Static asset stages.
//!
//! Each [`StaticMapping`] exposes a directory (or a single file) below a public
//! URL prefix with its own cache policy. A mapping only answers GET and HEAD
//! requests for files that exist; everything else continues down the pipeline
//! so later mappings and routes still see it.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::Response,
    Router,
};
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};

use crate::config::{
    ServerConfig, CACHE_CONTROL_BUILD, CACHE_CONTROL_DEVELOPMENT, CACHE_CONTROL_STATIC,
};
use crate::error::ServerError;
use crate::middleware::headers::ResponseHeaderPolicy;

/// Prefix of the content-hashed build output
pub const BUILD_PREFIX: &str = "/public/build";

#[derive(Clone)]
enum Source {
    Dir(ServeDir),
    File(ServeFile),
}

/// A public URL prefix backed by a directory or a file.
#[derive(Clone)]
pub struct StaticMapping {
    prefix: String,
    /// Sub path the server is mounted under, accepted ahead of `prefix`
    sub_path: Option<String>,
    source: Source,
    cache_control: HeaderValue,
}

impl StaticMapping {
    /// Serves files below `dir` under `prefix`.
    pub fn dir(prefix: &str, dir: impl AsRef<Path>, cache_control: &'static str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            sub_path: None,
            source: Source::Dir(ServeDir::new(dir).append_index_html_on_directories(false)),
            cache_control: HeaderValue::from_static(cache_control),
        }
    }

    /// Serves exactly `file` at `path`.
    pub fn file(path: &str, file: impl AsRef<Path>, cache_control: &'static str) -> Self {
        Self {
            prefix: path.to_string(),
            sub_path: None,
            source: Source::File(ServeFile::new(file)),
            cache_control: HeaderValue::from_static(cache_control),
        }
    }

    /// Also serves the mapping below `sub_path`, e.g. `/portico/public/...`.
    ///
    /// Static stages run ahead of the sub path stage, so they strip it themselves.
    pub fn with_sub_path(mut self, sub_path: &str) -> Self {
        let sub_path = sub_path.trim_end_matches('/');
        self.sub_path = (!sub_path.is_empty()).then(|| sub_path.to_string());
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Path below the prefix, `None` when the request is outside the mapping
    fn relative<'a>(&self, path: &'a str) -> Option<&'a str> {
        let path = match &self.sub_path {
            Some(sub_path) => match path.strip_prefix(sub_path.as_str()) {
                Some(rest) if rest.starts_with('/') => rest,
                _ => path,
            },
            None => path,
        };
        let rest = path.strip_prefix(self.prefix.as_str())?;
        match self.source {
            Source::File(_) => rest.is_empty().then_some("/"),
            Source::Dir(_) if rest.starts_with('/') => Some(rest),
            Source::Dir(_) => None,
        }
    }
}

/// Cache policy for a mapping
pub fn cache_policy(prefix: &str, development: bool) -> &'static str {
    if development {
        CACHE_CONTROL_DEVELOPMENT
    } else if prefix == BUILD_PREFIX {
        CACHE_CONTROL_BUILD
    } else {
        CACHE_CONTROL_STATIC
    }
}

/// The standard mappings, in the order they are tried.
///
/// The static root must exist. The attachments mapping is only added when
/// images are stored locally.
pub fn standard_mappings(config: &ServerConfig) -> Result<Vec<StaticMapping>, ServerError> {
    let root = &config.server.static_root_path;
    if !root.is_dir() {
        return Err(ServerError::FileNotFound {
            what: "static root",
            path: root.clone(),
        });
    }

    let development = config.is_development();
    let dir = |prefix: &str, path: PathBuf| {
        StaticMapping::dir(prefix, path, cache_policy(prefix, development))
    };

    let mut mappings = vec![
        dir(BUILD_PREFIX, root.join("build")),
        dir("/public", root.clone()),
        StaticMapping::file(
            "/robots.txt",
            root.join("robots.txt"),
            cache_policy("/robots.txt", development),
        ),
    ];

    if config.paths.image_upload_provider == "local" {
        mappings.push(dir("/public/img/attachments", config.paths.images_dir.clone()));
    }

    if config.server.serve_from_sub_path {
        let sub_path = config.server.app_sub_url.as_str();
        mappings = mappings
            .into_iter()
            .map(|mapping| mapping.with_sub_path(sub_path))
            .collect();
    }

    Ok(mappings)
}

#[derive(Clone)]
struct StaticStage {
    mapping: Arc<StaticMapping>,
    policy: Arc<ResponseHeaderPolicy>,
}

/// Layers a static mapping around `router`.
pub fn layer(router: Router, mapping: StaticMapping, policy: Arc<ResponseHeaderPolicy>) -> Router {
    let stage = StaticStage {
        mapping: Arc::new(mapping),
        policy,
    };
    router.layer(from_fn_with_state(stage, serve_static))
}

/// The request rewritten relative to the mapping, if the mapping may serve it
fn asset_request(request: &Request, mapping: &StaticMapping) -> Option<Request> {
    if request.method() != Method::GET && request.method() != Method::HEAD {
        return None;
    }
    let relative = mapping.relative(request.uri().path())?;

    let mut asset_request = Request::new(Body::empty());
    *asset_request.method_mut() = request.method().clone();
    *asset_request.headers_mut() = request.headers().clone();
    *asset_request.uri_mut() = relative.parse().ok()?;
    Some(asset_request)
}

async fn serve_static(State(stage): State<StaticStage>, request: Request, next: Next) -> Response {
    let Some(asset_request) = asset_request(&request, &stage.mapping) else {
        return next.run(request).await;
    };

    let result: Result<_, Infallible> = match &stage.mapping.source {
        Source::Dir(dir) => dir.clone().oneshot(asset_request).await,
        Source::File(file) => file.clone().oneshot(asset_request).await,
    };
    let response = match result {
        Ok(response) => response,
        Err(never) => match never {},
    };

    if matches!(
        response.status(),
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED
    ) {
        return next.run(request).await;
    }

    let mut response = response.map(Body::new);
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, stage.mapping.cache_control.clone());
    stage.policy.apply(headers);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    fn static_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("build")).unwrap();
        std::fs::write(dir.path().join("build/app.1234.js"), "console.log(1)").unwrap();
        std::fs::write(dir.path().join("logo.svg"), "<svg/>").unwrap();
        std::fs::write(dir.path().join("robots.txt"), "User-agent: *").unwrap();
        dir
    }

    fn app(config: &ServerConfig) -> Router {
        let policy = Arc::new(ResponseHeaderPolicy::from_config(config, false));
        let mut router = Router::new().fallback(get(|| async { "routed" }));
        for mapping in standard_mappings(config).unwrap().into_iter().rev() {
            router = layer(router, mapping, policy.clone());
        }
        router
    }

    async fn get_path(app: Router, path: &str) -> Response {
        app.oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn test_missing_static_root_is_fatal() {
        let config = ServerConfig::with_defaults("/nonexistent/static/root");
        let err = standard_mappings(&config).err().unwrap();
        assert!(matches!(err, ServerError::FileNotFound { what: "static root", .. }));
    }

    #[tokio::test]
    async fn test_build_assets_cache_for_a_year() {
        let root = static_root();
        let config = ServerConfig::with_defaults(root.path());

        let response = get_path(app(&config), "/public/build/app.1234.js").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], CACHE_CONTROL_BUILD);
        assert_eq!(response.headers()[header::X_FRAME_OPTIONS], "deny");
    }

    #[tokio::test]
    async fn test_development_disables_caching() {
        let root = static_root();
        let mut config = ServerConfig::with_defaults(root.path());
        config.environment.env = crate::config::Environment::Development;

        let response = get_path(app(&config), "/public/build/app.1234.js").await;
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            CACHE_CONTROL_DEVELOPMENT
        );
    }

    #[tokio::test]
    async fn test_other_assets_cache_for_an_hour() {
        let root = static_root();
        let config = ServerConfig::with_defaults(root.path());

        let response = get_path(app(&config), "/public/logo.svg").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], CACHE_CONTROL_STATIC);

        let response = get_path(app(&config), "/robots.txt").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_misses_fall_through_to_routes() {
        let root = static_root();
        let config = ServerConfig::with_defaults(root.path());

        for path in ["/public/missing.css", "/publicity", "/robots.txt/extra", "/public/build"] {
            let response = get_path(app(&config), path).await;
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            assert_eq!(&body[..], b"routed", "{} should reach the routes", path);
        }
    }

    #[tokio::test]
    async fn test_assets_are_served_below_the_sub_path() {
        let root = static_root();
        let mut config = ServerConfig::with_defaults(root.path());
        config.server.app_sub_url = "/portico".to_string();
        config.server.serve_from_sub_path = true;

        let response = get_path(app(&config), "/portico/public/build/app.1234.js").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], CACHE_CONTROL_BUILD);

        let response = get_path(app(&config), "/portico/robots.txt").await;
        assert_eq!(response.status(), StatusCode::OK);

        for path in ["/porticox/public/logo.svg", "/portico/missing.css"] {
            let response = get_path(app(&config), path).await;
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            assert_eq!(&body[..], b"routed", "{} should reach the routes", path);
        }
    }

    #[tokio::test]
    async fn test_non_get_requests_are_not_served() {
        let root = static_root();
        let config = ServerConfig::with_defaults(root.path());

        let response = app(&config)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/public/logo.svg")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(!response.headers().contains_key(header::CACHE_CONTROL));
    }
}
