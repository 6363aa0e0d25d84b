//! Server lifecycle.
//!
//! [`HttpServer::run`] drives a server through
//! `Unstarted → Configuring → Listening → ShuttingDown → Stopped`:
//!
//! 1. Configuring: validate the transport (TLS files are checked before any
//!    socket exists), load views, assemble the pipeline and route table, then
//!    adopt the pre-supplied listener or open one.
//! 2. Listening: serve until the cancellation token fires or serving fails.
//! 3. ShuttingDown: stop accepting, drain in-flight requests for the grace
//!    period, then close the remaining connections.
//!
//! `run` returns only after the shutdown watcher has finished, and a
//! cancellation-triggered stop is `Ok(())`.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{HttpSettings, ServerConfig};
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::middleware::context::{OrgSwitcher, SessionResolver};
use crate::middleware::{Middleware, Pipeline, PipelineHooks};
use crate::routes::{NamedMiddleware, NamedMiddlewareProvider, RouteComposer, RouteRegistrar};
use crate::state::{BuildInfo, HealthProbe, NoPersistence, PipelineState};
use crate::templates::ViewRenderer;
use crate::transport::{Listener, Transport};

use super::shutdown::{self, Drain};

/// Lifecycle states, in the only order a server moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    Unstarted,
    Configuring,
    Listening,
    ShuttingDown,
    Stopped,
}

/// Write side of the state channel; states only ever advance.
#[derive(Clone)]
pub(crate) struct Lifecycle {
    tx: Arc<watch::Sender<ServerState>>,
}

impl Lifecycle {
    pub(crate) fn from_sender(tx: watch::Sender<ServerState>) -> Self {
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn advance(&self, next: ServerState) {
        let advanced = self.tx.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if advanced {
            tracing::debug!(state = ?next, "Server state changed");
        }
    }
}

/// Observes a server from outside its run.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    state: watch::Receiver<ServerState>,
    bound: watch::Receiver<Option<SocketAddr>>,
}

impl ServerHandle {
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Waits until the server has reached `target` (or any later state).
    pub async fn wait_for(&self, target: ServerState) -> ServerState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|state| *state >= target).await.map(|state| *state);
        match reached {
            Ok(state) => state,
            Err(_) => *rx.borrow(),
        }
    }

    /// Waits for the listener and returns its TCP address.
    ///
    /// `None` for Unix sockets and for runs that failed before listening.
    pub async fn listening(&self) -> Option<SocketAddr> {
        // The address is published before the state becomes Listening
        self.wait_for(ServerState::Listening).await;
        *self.bound.borrow()
    }
}

/// An HTTP server ready to run once.
pub struct HttpServer {
    config: Arc<ServerConfig>,
    listener: Option<Listener>,
    metrics: Metrics,
    build: BuildInfo,
    probe: Arc<dyn HealthProbe>,
    hooks: PipelineHooks,
    composer: RouteComposer,
    lifecycle: Lifecycle,
    bound: Arc<watch::Sender<Option<SocketAddr>>>,
}

impl HttpServer {
    pub fn builder(config: ServerConfig) -> HttpServerBuilder {
        HttpServerBuilder::new(config)
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: self.lifecycle.tx.subscribe(),
            bound: self.bound.subscribe(),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configures, listens and serves until `shutdown` is cancelled.
    ///
    /// Startup failures (missing certificate files, unusable listener, bad
    /// views directory, ...) are returned before anything is served. Once
    /// serving, only accept-loop failures are errors.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let lifecycle = self.lifecycle.clone();
        lifecycle.advance(ServerState::Configuring);

        let result = self.configure_and_serve(shutdown).await;
        match &result {
            Ok(()) => tracing::info!("HTTP server stopped"),
            Err(e) if e.is_startup() => tracing::error!(error = %e, "HTTP server failed to start"),
            Err(e) => tracing::error!(error = %e, "HTTP server stopped with error"),
        }

        lifecycle.advance(ServerState::Stopped);
        result
    }

    async fn configure_and_serve(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let HttpServer {
            config,
            listener,
            metrics,
            build,
            probe,
            hooks,
            composer,
            lifecycle,
            bound,
        } = self;
        let settings = &config.server;

        let transport = Transport::configure(settings)?;
        let views = ViewRenderer::load(&settings.views_path(), &settings.app_sub_url)?;
        let state = PipelineState::new(
            config.clone(),
            views,
            metrics,
            build,
            probe,
            transport.is_tls(),
        );
        let pipeline = Pipeline::standard(&state, hooks)?;
        tracing::debug!(stages = ?pipeline.stage_names(), "Assembled request pipeline");
        let app = pipeline.wrap(composer.compose());

        let listener = match listener {
            Some(listener) => {
                listener.check_compatible(&transport)?;
                tracing::debug!(address = %listener.describe(), "Using provided listener");
                listener
            }
            None => Listener::open(settings, &transport)?,
        };

        tracing::info!(
            address = %listener.describe(),
            protocol = %settings.protocol,
            sub_url = %settings.app_sub_url,
            "HTTP Server Listen"
        );
        bound.send_replace(listener.tcp_addr());
        lifecycle.advance(ServerState::Listening);

        let grace = config.shutdown.grace_period();
        match (listener, transport) {
            (Listener::Tcp(tcp), transport @ (Transport::Plain | Transport::Tls { .. })) => {
                serve_tcp(app, tcp, transport, settings, grace, shutdown, lifecycle).await
            }
            #[cfg(unix)]
            (Listener::Unix(unix), Transport::Socket) => {
                serve_unix(app, unix, grace, shutdown, lifecycle).await
            }
            (listener, transport) => Err(ServerError::Configuration(format!(
                "listener {} cannot serve the {:?} transport",
                listener.describe(),
                transport
            ))),
        }
    }
}

fn apply_read_timeout(builder: &mut auto::Builder<TokioExecutor>, timeout: Option<Duration>) {
    if let Some(timeout) = timeout {
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(timeout);
    }
}

async fn serve_tcp(
    app: Router,
    listener: std::net::TcpListener,
    transport: Transport,
    settings: &HttpSettings,
    grace: Duration,
    shutdown: CancellationToken,
    lifecycle: Lifecycle,
) -> Result<(), ServerError> {
    let target = settings.bind_address();
    listener
        .set_nonblocking(true)
        .map_err(|e| ServerError::listener(&target, e))?;

    let handle = Handle::new();
    let serve_done = CancellationToken::new();
    let watcher = shutdown::spawn_watcher(
        shutdown,
        serve_done.clone(),
        Drain::Handle(handle.clone()),
        grace,
        lifecycle,
    );

    let mut reload = None;
    let result = match transport {
        Transport::Tls { policy, config, .. } => {
            let tls_config = RustlsConfig::from_config(config);
            reload = shutdown::spawn_reload_handler(
                tls_config.clone(),
                policy,
                PathBuf::from(&settings.cert_file),
                PathBuf::from(&settings.cert_key),
                serve_done.clone(),
            );
            let mut server = axum_server::from_tcp_rustls(listener, tls_config).handle(handle);
            apply_read_timeout(server.http_builder(), settings.read_timeout());
            server.serve(app.into_make_service()).await
        }
        Transport::Plain | Transport::Socket => {
            let mut server = axum_server::from_tcp(listener).handle(handle);
            let builder = server.http_builder();
            // Plain transports speak HTTP/1.1 only, no h2c
            *builder = builder.clone().http1_only();
            apply_read_timeout(builder, settings.read_timeout());
            server.serve(app.into_make_service()).await
        }
    };

    serve_done.cancel();
    join_background(watcher, reload).await;
    result.map_err(ServerError::Serve)
}

#[cfg(unix)]
async fn serve_unix(
    app: Router,
    listener: std::os::unix::net::UnixListener,
    grace: Duration,
    shutdown: CancellationToken,
    lifecycle: Lifecycle,
) -> Result<(), ServerError> {
    listener
        .set_nonblocking(true)
        .map_err(|e| ServerError::listener("unix socket", e))?;
    let listener = tokio::net::UnixListener::from_std(listener)
        .map_err(|e| ServerError::listener("unix socket", e))?;

    let drain = CancellationToken::new();
    let serve_done = CancellationToken::new();
    let watcher = shutdown::spawn_watcher(
        shutdown,
        serve_done.clone(),
        Drain::Token(drain.clone()),
        grace,
        lifecycle,
    );

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(drain.clone().cancelled_owned())
        .into_future();
    let deadline = async {
        drain.cancelled().await;
        tokio::time::sleep(grace).await;
    };

    let result = tokio::select! {
        result = server => result,
        _ = deadline => {
            tracing::warn!("Grace period elapsed, abandoning open connections");
            Ok(())
        }
    };

    serve_done.cancel();
    join_background(watcher, None).await;
    result.map_err(ServerError::Serve)
}

async fn join_background(watcher: tokio::task::JoinHandle<()>, reload: Option<tokio::task::JoinHandle<()>>) {
    if let Err(e) = watcher.await {
        tracing::warn!(error = %e, "Shutdown watcher ended abnormally");
    }
    if let Some(reload) = reload {
        if let Err(e) = reload.await {
            tracing::warn!(error = %e, "Certificate reload task ended abnormally");
        }
    }
}

/// Collects collaborators and settings for an [`HttpServer`].
pub struct HttpServerBuilder {
    config: ServerConfig,
    listener: Option<Listener>,
    metrics: Option<Metrics>,
    build: Option<BuildInfo>,
    probe: Option<Arc<dyn HealthProbe>>,
    hooks: PipelineHooks,
    registrars: Vec<Arc<dyn RouteRegistrar>>,
    app_registrars: Vec<Arc<dyn RouteRegistrar>>,
    named: Vec<Arc<dyn NamedMiddlewareProvider>>,
}

impl HttpServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            listener: None,
            metrics: None,
            build: None,
            probe: None,
            hooks: PipelineHooks::default(),
            registrars: Vec::new(),
            app_registrars: Vec::new(),
            named: Vec::new(),
        }
    }

    /// Serves on an already bound listener instead of opening one.
    pub fn listener(mut self, listener: impl Into<Listener>) -> Self {
        self.listener = Some(listener.into());
        self
    }

    /// Shares a metrics registry with the embedding process.
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build_info(mut self, build: BuildInfo) -> Self {
        self.build = Some(build);
        self
    }

    pub fn health_probe(mut self, probe: impl HealthProbe) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    pub fn session_resolver(mut self, resolver: impl SessionResolver) -> Self {
        self.hooks.sessions = Some(Arc::new(resolver));
        self
    }

    pub fn org_switcher(mut self, switcher: impl OrgSwitcher) -> Self {
        self.hooks.org_switcher = Some(Arc::new(switcher));
        self
    }

    /// Permission loading that runs after identity resolution.
    pub fn access_control(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.hooks.access_control = Some(middleware);
        self
    }

    /// Appends a middleware after every built-in stage.
    ///
    /// Middleware added here runs in the order it was added, and never ahead
    /// of the liveness interceptors.
    pub fn add_middleware(mut self, name: impl Into<String>, middleware: Arc<dyn Middleware>) -> Self {
        self.hooks.extra.push((name.into(), middleware));
        self
    }

    pub fn register_routes(mut self, registrar: impl RouteRegistrar) -> Self {
        self.registrars.push(Arc::new(registrar));
        self
    }

    /// Application (plugin) routes, registered after every core registrar.
    pub fn register_app_routes(mut self, registrar: impl RouteRegistrar) -> Self {
        self.app_registrars.push(Arc::new(registrar));
        self
    }

    pub fn named_middleware(mut self, provider: impl NamedMiddlewareProvider) -> Self {
        self.named.push(Arc::new(provider));
        self
    }

    pub fn build(self) -> HttpServer {
        let (state_tx, _) = watch::channel(ServerState::Unstarted);
        let (bound_tx, _) = watch::channel(None);

        HttpServer {
            config: Arc::new(self.config),
            listener: self.listener,
            metrics: self.metrics.unwrap_or_default(),
            build: self.build.unwrap_or_default(),
            probe: self.probe.unwrap_or_else(|| Arc::new(NoPersistence)),
            hooks: self.hooks,
            composer: RouteComposer::new(
                self.registrars,
                self.app_registrars,
                NamedMiddleware::new(self.named),
            ),
            lifecycle: Lifecycle::from_sender(state_tx),
            bound: Arc::new(bound_tx),
        }
    }
}
