//! Graceful shutdown and signal handling.
//!
//! Handles:
//! - Cancellation of the run's token: stop accepting, drain connections for
//!   the grace period, then close whatever is left
//! - SIGTERM/SIGINT (binary only): cancel the process-wide token
//! - SIGHUP: certificate reload while a TLS run is active

use std::path::PathBuf;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::server::{Lifecycle, ServerState};
use crate::transport::tls::TlsPolicy;

/// How a run is told to stop accepting and drain.
pub(crate) enum Drain {
    /// axum-server handle (TCP transports), closes connections after the grace period
    Handle(Handle),
    /// Graceful-shutdown trigger of an `axum::serve` run (Unix sockets)
    Token(CancellationToken),
}

impl Drain {
    fn begin(&self, grace: Duration) {
        match self {
            Drain::Handle(handle) => handle.graceful_shutdown(Some(grace)),
            Drain::Token(token) => token.cancel(),
        }
    }
}

/// Spawns the task that turns cancellation of `shutdown` into a drain.
///
/// The task ends on its own once `serve_done` is cancelled, so the run can
/// join it before reporting completion.
pub(crate) fn spawn_watcher(
    shutdown: CancellationToken,
    serve_done: CancellationToken,
    drain: Drain,
    grace: Duration,
    lifecycle: Lifecycle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {
                lifecycle.advance(ServerState::ShuttingDown);
                tracing::info!(
                    grace_period_secs = grace.as_secs(),
                    "Graceful shutdown initiated, waiting for connections to close"
                );
                drain.begin(grace);
            }
            _ = serve_done.cancelled() => {}
        }
    })
}

/// Cancels `token` on SIGTERM or SIGINT.
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = token.cancelled() => return,
        }

        token.cancel();
    })
}

/// Reloads the certificate and key on SIGHUP until `stop` is cancelled.
///
/// The reloaded configuration uses the same cipher and ALPN policy. A failed
/// reload keeps serving the previous certificate.
#[cfg(unix)]
pub(crate) fn spawn_reload_handler(
    tls_config: RustlsConfig,
    policy: TlsPolicy,
    cert_path: PathBuf,
    key_path: PathBuf,
    stop: CancellationToken,
) -> Option<JoinHandle<()>> {
    let mut sighup =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGHUP handler, certificate reload disabled");
                return None;
            }
        };

    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                received = sighup.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }
            tracing::info!("Received SIGHUP, reloading TLS certificates");

            match policy.server_config(&cert_path, &key_path) {
                Ok(config) => {
                    tls_config.reload_from_config(config);
                    tracing::info!(
                        cert = %cert_path.display(),
                        key = %key_path.display(),
                        "TLS certificates reloaded successfully"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        cert = %cert_path.display(),
                        key = %key_path.display(),
                        "Failed to reload TLS certificates"
                    );
                }
            }
        }
    }))
}

/// No-op reload handler for non-Unix platforms.
#[cfg(not(unix))]
pub(crate) fn spawn_reload_handler(
    _tls_config: RustlsConfig,
    _policy: TlsPolicy,
    _cert_path: PathBuf,
    _key_path: PathBuf,
    _stop: CancellationToken,
) -> Option<JoinHandle<()>> {
    tracing::warn!("Certificate hot-reload via SIGHUP not supported on this platform");
    None
}
