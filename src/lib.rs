//! Portico - embeddable HTTP server bootstrap
//!
//! Builds the HTTP front of a web application: transport selection (plain,
//! TLS, HTTP/2, Unix socket), an ordered middleware pipeline with liveness
//! probes that bypass authentication, static assets, route composition and a
//! lifecycle with graceful, cancellation-driven shutdown.
//!
//! ```no_run
//! use portico::{HttpServer, ServerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::load("config/default.toml")?;
//! let server = HttpServer::builder(config)
//!     .register_routes(|router: axum::Router, _named: &portico::NamedMiddleware| {
//!         router.route("/api/hello", axum::routing::get(|| async { "hello" }))
//!     })
//!     .build();
//!
//! let shutdown = CancellationToken::new();
//! portico::cancel_on_signal(shutdown.clone());
//! server.run(shutdown).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod templates;
pub mod transport;

pub use config::{Protocol, ServerConfig};
pub use error::{AppError, ServerError};
pub use http::{cancel_on_signal, HttpServer, HttpServerBuilder, ServerHandle, ServerState};
pub use metrics::Metrics;
pub use middleware::context::{CurrentIdentity, Identity, OrgSwitcher, SessionResolver};
pub use middleware::{middleware_fn, Middleware, Pipeline, Stage};
pub use routes::{NamedMiddleware, NamedMiddlewareProvider, RouteComposer, RouteRegistrar};
pub use state::{BuildInfo, HealthProbe, ProbeError};
pub use transport::{Listener, Transport};
