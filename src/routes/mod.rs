//! Route table composition.
//!
//! The route table is built once per run from the registrars the embedding
//! process supplied: core registrars first, then application (plugin)
//! registrars, then the terminal not-found handler. A registrar receives the
//! router built so far and the [`NamedMiddleware`] it can wrap individual
//! routes in.

pub mod health;
pub mod not_found;

use std::sync::Arc;

use axum::{routing::MethodRouter, Router};

use crate::middleware::{layer_middleware_route, Middleware};

/// Adds routes to the table.
pub trait RouteRegistrar: Send + Sync + 'static {
    fn register(&self, router: Router, named: &NamedMiddleware) -> Router;
}

impl<F> RouteRegistrar for F
where
    F: Fn(Router, &NamedMiddleware) -> Router + Send + Sync + 'static,
{
    fn register(&self, router: Router, named: &NamedMiddleware) -> Router {
        self(router, named)
    }
}

/// Supplies per-route middleware by route name.
pub trait NamedMiddlewareProvider: Send + Sync + 'static {
    fn for_route(&self, route: &str) -> Option<Arc<dyn Middleware>>;
}

/// Every registered [`NamedMiddlewareProvider`], in registration order.
#[derive(Clone, Default)]
pub struct NamedMiddleware {
    providers: Vec<Arc<dyn NamedMiddlewareProvider>>,
}

impl NamedMiddleware {
    pub fn new(providers: Vec<Arc<dyn NamedMiddlewareProvider>>) -> Self {
        Self { providers }
    }

    /// Wraps `route` in each provider's middleware for `name`.
    ///
    /// The first provider's middleware runs first.
    pub fn wrap(&self, name: &str, mut route: MethodRouter) -> MethodRouter {
        for provider in self.providers.iter().rev() {
            if let Some(middleware) = provider.for_route(name) {
                route = layer_middleware_route(route, middleware);
            }
        }
        route
    }
}

/// Builds the route table from registrars.
#[derive(Default)]
pub struct RouteComposer {
    registrars: Vec<Arc<dyn RouteRegistrar>>,
    app_registrars: Vec<Arc<dyn RouteRegistrar>>,
    named: NamedMiddleware,
}

impl RouteComposer {
    pub fn new(
        registrars: Vec<Arc<dyn RouteRegistrar>>,
        app_registrars: Vec<Arc<dyn RouteRegistrar>>,
        named: NamedMiddleware,
    ) -> Self {
        Self {
            registrars,
            app_registrars,
            named,
        }
    }

    /// Applies every registrar in order and terminates the table with the
    /// not-found handler.
    pub fn compose(&self) -> Router {
        let router = self
            .registrars
            .iter()
            .chain(&self.app_registrars)
            .fold(Router::new(), |router, registrar| {
                registrar.register(router, &self.named)
            });
        router.fallback(not_found::not_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::StatusCode;
    use axum::middleware::Next;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use tower::ServiceExt;

    use crate::middleware::context::{CurrentIdentity, Identity};
    use crate::middleware::middleware_fn;

    struct DenyByName(&'static str);

    impl NamedMiddlewareProvider for DenyByName {
        fn for_route(&self, route: &str) -> Option<Arc<dyn Middleware>> {
            (route == self.0).then(|| {
                middleware_fn(|_request: Request, _next: Next| async move {
                    StatusCode::FORBIDDEN.into_response()
                })
            })
        }
    }

    fn signed_in(uri: &str) -> Request {
        let mut request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        request.extensions_mut().insert(CurrentIdentity(Some(Identity {
            user_id: 1,
            login: "admin".to_string(),
            org_id: 1,
        })));
        request
    }

    #[tokio::test]
    async fn test_registrars_apply_in_order() {
        let core = |router: Router, _named: &NamedMiddleware| {
            router.route("/api/search", get(|| async { "search" }))
        };
        // Later registrars see (and may extend) earlier routes
        let plugin = |router: Router, _named: &NamedMiddleware| {
            router.route("/api/plugins/app", get(|| async { "plugin" }))
        };

        let composer = RouteComposer::new(
            vec![Arc::new(core) as Arc<dyn RouteRegistrar>],
            vec![Arc::new(plugin) as Arc<dyn RouteRegistrar>],
            NamedMiddleware::default(),
        );
        let app = composer.compose();

        let response = app.clone().oneshot(signed_in("/api/search")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(signed_in("/api/plugins/app")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(signed_in("/api/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_named_middleware_wraps_only_its_route() {
        let registrar = |router: Router, named: &NamedMiddleware| {
            router
                .route("/api/admin", named.wrap("admin", get(|| async { "admin" })))
                .route("/api/public", named.wrap("public", get(|| async { "public" })))
        };
        let named = NamedMiddleware::new(vec![
            Arc::new(DenyByName("admin")) as Arc<dyn NamedMiddlewareProvider>
        ]);
        let app = RouteComposer::new(
            vec![Arc::new(registrar) as Arc<dyn RouteRegistrar>],
            Vec::new(),
            named,
        )
        .compose();

        let response = app.clone().oneshot(signed_in("/api/admin")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = app.oneshot(signed_in("/api/public")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
