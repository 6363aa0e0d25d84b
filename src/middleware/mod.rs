//! Request pipeline assembly.
//!
//! The pipeline is an ordered list of [`Stage`]s. Each stage wraps the rest of
//! the pipeline, so a stage can rewrite the request, answer it without calling
//! further, or post-process the response. Stages run before routing: the route
//! table is mounted as the fallback of an otherwise empty router and the stages
//! are layered around that, outermost first.
//!
//! [`Pipeline::standard`] produces the fixed built-in order. Liveness
//! interceptors always sit ahead of identity resolution, access control and
//! every middleware registered by the embedding process, so probes keep
//! answering when authentication is broken.

pub mod context;
pub mod headers;
pub mod recovery;
pub mod request;

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::Request,
    middleware::{from_fn, from_fn_with_state, Next},
    response::Response,
    routing::MethodRouter,
    Router,
};
use tower_http::compression::CompressionLayer;

use crate::error::ServerError;
use crate::http::static_files;
use crate::routes::health;
use crate::state::PipelineState;

use self::context::{OrgSwitcher, SessionResolver};
use self::headers::ResponseHeaderPolicy;

/// A request interceptor supplied by the embedding process.
///
/// Implementations call `next.run(request)` to continue down the pipeline or
/// return a response of their own to stop it.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, request: Request, next: Next) -> Response;
}

struct FnMiddleware<F>(F);

#[async_trait]
impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    async fn handle(&self, request: Request, next: Next) -> Response {
        (self.0)(request, next).await
    }
}

/// Adapts an async function or closure into a [`Middleware`].
pub fn middleware_fn<F, Fut>(f: F) -> Arc<dyn Middleware>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(FnMiddleware(f))
}

/// Wraps `router` in `middleware`.
pub(crate) fn layer_middleware(router: Router, middleware: Arc<dyn Middleware>) -> Router {
    router.layer(from_fn(move |request: Request, next: Next| {
        let middleware = middleware.clone();
        async move { middleware.handle(request, next).await }
    }))
}

/// Wraps a single route in `middleware`.
pub(crate) fn layer_middleware_route(
    route: MethodRouter,
    middleware: Arc<dyn Middleware>,
) -> MethodRouter {
    route.layer(from_fn(move |request: Request, next: Next| {
        let middleware = middleware.clone();
        async move { middleware.handle(request, next).await }
    }))
}

/// One named step of the pipeline.
pub struct Stage {
    name: Cow<'static, str>,
    apply: Box<dyn FnOnce(Router) -> Router + Send>,
}

impl Stage {
    /// Stage that layers whatever `apply` adds around the inner router.
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        apply: impl FnOnce(Router) -> Router + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            apply: Box::new(apply),
        }
    }

    /// Stage that runs a [`Middleware`].
    pub fn middleware(name: impl Into<Cow<'static, str>>, middleware: Arc<dyn Middleware>) -> Self {
        Self::new(name, move |router| layer_middleware(router, middleware))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Stage").field(&self.name).finish()
    }
}

/// Collaborators the standard pipeline calls into.
#[derive(Default)]
pub struct PipelineHooks {
    pub sessions: Option<Arc<dyn SessionResolver>>,
    pub org_switcher: Option<Arc<dyn OrgSwitcher>>,
    pub access_control: Option<Arc<dyn Middleware>>,
    /// Extra middleware, in registration order
    pub extra: Vec<(String, Arc<dyn Middleware>)>,
}

/// Ordered list of stages, outermost first.
#[derive(Debug, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Stage) -> &mut Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// Builds the fixed pipeline for a run.
    ///
    /// Fails when a static directory is missing or the content security
    /// policy template is not a valid header value.
    pub fn standard(state: &PipelineState, hooks: PipelineHooks) -> Result<Self, ServerError> {
        let config = &state.config;
        let policy = Arc::new(ResponseHeaderPolicy::from_config(config, state.tls));
        let mut pipeline = Pipeline::new();

        pipeline.push(Stage::new("request_id", |router| {
            router.layer(from_fn(request::request_id_layer))
        }));

        let logging_state = state.clone();
        pipeline.push(Stage::new("logging", move |router| {
            router.layer(from_fn_with_state(logging_state, request::logging_layer))
        }));

        if config.server.enable_gzip {
            pipeline.push(Stage::new("gzip", |router| {
                router.layer(CompressionLayer::new().gzip(true))
            }));
        }

        pipeline.push(Stage::new("recovery", |router| {
            router.layer(recovery::catch_panic_layer())
        }));

        for mapping in static_files::standard_mappings(config)? {
            let name = format!("static:{}", mapping.prefix());
            let stage_policy = policy.clone();
            pipeline.push(Stage::new(name, move |router| {
                static_files::layer(router, mapping, stage_policy)
            }));
        }

        let header_policy = policy.clone();
        pipeline.push(Stage::new("default_headers", move |router| {
            headers::default_headers_layer(router, header_policy)
        }));

        if config.server.serve_from_sub_path && !config.server.app_sub_url.is_empty() {
            let prefix: Arc<str> = Arc::from(config.server.app_sub_url.as_str());
            pipeline.push(Stage::new("sub_path", move |router| {
                router.layer(from_fn_with_state(prefix, request::sub_path_layer))
            }));
        }

        let views = state.views.clone();
        pipeline.push(Stage::new("views", move |router| {
            router.layer(from_fn_with_state(views, request::views_layer))
        }));

        pipeline.push(Stage::new("healthz", |router| {
            router.layer(from_fn(health::healthz))
        }));

        let health_state = state.clone();
        pipeline.push(Stage::new("api_health", move |router| {
            router.layer(from_fn_with_state(health_state, health::api_health))
        }));

        if config.metrics.enabled {
            let metrics_state = state.clone();
            pipeline.push(Stage::new("metrics", move |router| {
                router.layer(from_fn_with_state(metrics_state, health::metrics_endpoint))
            }));
        }

        let sessions = hooks
            .sessions
            .unwrap_or_else(|| Arc::new(context::Anonymous) as Arc<dyn SessionResolver>);
        pipeline.push(Stage::new("context", move |router| {
            router.layer(from_fn_with_state(sessions, context::context_layer))
        }));

        if let Some(switcher) = hooks.org_switcher {
            let redirect = context::OrgRedirect::new(switcher, &config.server.app_sub_url);
            pipeline.push(Stage::new("org_redirect", move |router| {
                router.layer(from_fn_with_state(redirect, context::org_redirect_layer))
            }));
        }

        if let Some(access_control) = hooks.access_control {
            pipeline.push(Stage::middleware("access_control", access_control));
        }

        if config.server.enforce_domain {
            let host_state = Arc::new(headers::CanonicalHost::from_settings(&config.server));
            pipeline.push(Stage::new("validate_host", move |router| {
                router.layer(from_fn_with_state(host_state, headers::validate_host_layer))
            }));
        }

        pipeline.push(Stage::new("no_cache", |router| {
            router.layer(from_fn(headers::no_cache_flag_layer))
        }));

        if config.security.content_security_policy {
            let csp = Arc::new(headers::CspTemplate::new(
                &config.security.content_security_policy_template,
                &config.server.app_sub_url,
            )?);
            pipeline.push(Stage::new("csp", move |router| {
                router.layer(from_fn_with_state(csp, headers::csp_layer))
            }));
        }

        for (name, middleware) in hooks.extra {
            pipeline.push(Stage::middleware(name, middleware));
        }

        Ok(pipeline)
    }

    /// Wraps the route table in every stage.
    pub fn wrap(self, routes: Router) -> Router {
        let mut app = Router::new().fallback_service(routes);
        // Layers added later run first, so apply innermost stages first
        for stage in self.stages.into_iter().rev() {
            tracing::trace!(stage = %stage.name, "Applying pipeline stage");
            app = (stage.apply)(app);
        }
        app
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use std::sync::Mutex;
    use tower::ServiceExt;

    fn trace_stage(name: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Stage {
        Stage::middleware(
            name,
            middleware_fn(move |request: Request, next: Next| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(name);
                    next.run(request).await
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_stages_run_in_declaration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline
            .push(trace_stage("first", log.clone()))
            .push(trace_stage("second", log.clone()))
            .push(trace_stage("third", log.clone()));
        assert_eq!(pipeline.stage_names(), vec!["first", "second", "third"]);

        let app = pipeline.wrap(Router::new().route("/", get(|| async { "routed" })));
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_stage_can_rewrite_before_routing() {
        let mut pipeline = Pipeline::new();
        pipeline.push(Stage::middleware(
            "rewrite",
            middleware_fn(|mut request: Request, next: Next| async move {
                *request.uri_mut() = "/target".parse().unwrap();
                next.run(request).await
            }),
        ));

        let app = pipeline.wrap(Router::new().route("/target", get(|| async { "hit" })));
        let response = app
            .oneshot(Request::builder().uri("/elsewhere").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    fn pipeline_state(config: crate::config::ServerConfig) -> PipelineState {
        let views = crate::templates::ViewRenderer::load(
            &config.server.views_path(),
            &config.server.app_sub_url,
        )
        .unwrap();
        PipelineState::new(
            Arc::new(config),
            views,
            crate::metrics::Metrics::new(),
            crate::state::BuildInfo::default(),
            Arc::new(crate::state::NoPersistence),
            false,
        )
    }

    #[test]
    fn test_standard_order_keeps_liveness_ahead_of_auth() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("views")).unwrap();
        let mut config = crate::config::ServerConfig::with_defaults(root.path());
        config.server.enable_gzip = true;
        config.server.enforce_domain = true;

        let hooks = PipelineHooks {
            access_control: Some(middleware_fn(|request: Request, next: Next| async move {
                next.run(request).await
            })),
            extra: vec![(
                "audit".to_string(),
                middleware_fn(|request: Request, next: Next| async move {
                    next.run(request).await
                }),
            )],
            ..Default::default()
        };

        let pipeline = Pipeline::standard(&pipeline_state(config), hooks).unwrap();
        assert_eq!(
            pipeline.stage_names(),
            vec![
                "request_id",
                "logging",
                "gzip",
                "recovery",
                "static:/public/build",
                "static:/public",
                "static:/robots.txt",
                "default_headers",
                "views",
                "healthz",
                "api_health",
                "metrics",
                "context",
                "access_control",
                "validate_host",
                "no_cache",
                "audit",
            ]
        );
    }

    #[tokio::test]
    async fn test_stage_can_short_circuit() {
        let mut pipeline = Pipeline::new();
        pipeline.push(Stage::middleware(
            "deny",
            middleware_fn(|_request: Request, _next: Next| async move {
                StatusCode::FORBIDDEN.into_response()
            }),
        ));

        let app = pipeline.wrap(Router::new().route("/", get(|| async { "unreachable" })));
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
