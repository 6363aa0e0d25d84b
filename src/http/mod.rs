//! HTTP server module.
//!
//! Serves the assembled pipeline over one of four transports:
//! - **http**: plain HTTP/1.1 (and h2c) over TCP
//! - **https**: TLS with HTTP/1.1 only
//! - **h2**: TLS with HTTP/2 preferred, HTTP/1.1 as fallback
//! - **socket**: plain HTTP over a Unix domain socket
//!
//! The server includes:
//! - Graceful shutdown driven by a cancellation token
//! - Certificate hot-reload via SIGHUP (TLS transports)
//! - Static asset stages with per-mapping cache policy

mod server;
pub(crate) mod shutdown;
pub mod static_files;

pub use server::{HttpServer, HttpServerBuilder, ServerHandle, ServerState};
pub use shutdown::cancel_on_signal;
