//! Transport selection and listener acquisition.
//!
//! [`Transport::configure`] validates the configured protocol and produces the
//! TLS setup (if any) before a socket exists. [`Listener`] is the single bound
//! endpoint a server runs on: either handed in by the embedding process (test
//! harnesses, socket activation) or opened here from the configuration.

pub mod tls;

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::config::{HttpSettings, Protocol};
use crate::error::ServerError;

use self::tls::TlsPolicy;

/// Validated transport for a run.
#[derive(Clone)]
pub enum Transport {
    /// Plain HTTP/1.1 and h2c over TCP
    Plain,
    /// Plain HTTP over a Unix domain socket
    Socket,
    /// HTTPS or HTTP/2 over TLS
    Tls {
        protocol: Protocol,
        policy: TlsPolicy,
        config: Arc<rustls::ServerConfig>,
    },
}

impl Transport {
    /// Validates `settings` and builds the TLS configuration for TLS protocols.
    ///
    /// Certificate and key files are checked before anything is parsed, and
    /// before any listener is created.
    pub fn configure(settings: &HttpSettings) -> Result<Self, ServerError> {
        match settings.protocol {
            Protocol::Http => Ok(Transport::Plain),
            Protocol::Socket => {
                if cfg!(unix) {
                    Ok(Transport::Socket)
                } else {
                    Err(ServerError::Configuration(
                        "the socket protocol requires a Unix platform".to_string(),
                    ))
                }
            }
            Protocol::Https | Protocol::H2 => {
                tls::check_cert_files(settings)?;
                let policy = TlsPolicy::for_protocol(settings.protocol).ok_or_else(|| {
                    ServerError::Configuration(format!(
                        "no TLS policy for protocol {}",
                        settings.protocol
                    ))
                })?;
                let config = policy.server_config(
                    Path::new(&settings.cert_file),
                    Path::new(&settings.cert_key),
                )?;
                Ok(Transport::Tls {
                    protocol: settings.protocol,
                    policy,
                    config,
                })
            }
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls { .. })
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Plain => f.write_str("Plain"),
            Transport::Socket => f.write_str("Socket"),
            Transport::Tls { protocol, .. } => write!(f, "Tls({})", protocol),
        }
    }
}

/// A bound endpoint owned by one running server.
#[derive(Debug)]
pub enum Listener {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

impl Listener {
    /// Opens the listener the transport needs.
    ///
    /// Unix sockets are made group writable after creation.
    pub fn open(settings: &HttpSettings, transport: &Transport) -> Result<Self, ServerError> {
        match transport {
            Transport::Plain | Transport::Tls { .. } => {
                let addr = settings.bind_address();
                let listener = std::net::TcpListener::bind(&addr)
                    .map_err(|e| ServerError::listener(&addr, e))?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            Transport::Socket => open_unix(&settings.socket),
            #[cfg(not(unix))]
            Transport::Socket => Err(ServerError::Configuration(
                "the socket protocol requires a Unix platform".to_string(),
            )),
        }
    }

    /// Checks that a pre-supplied listener can carry `transport`.
    pub fn check_compatible(&self, transport: &Transport) -> Result<(), ServerError> {
        match (self, transport) {
            (Listener::Tcp(_), Transport::Plain | Transport::Tls { .. }) => Ok(()),
            #[cfg(unix)]
            (Listener::Unix(_), Transport::Socket) => Ok(()),
            (listener, transport) => Err(ServerError::Configuration(format!(
                "provided listener {} cannot serve the {:?} transport",
                listener.describe(),
                transport
            ))),
        }
    }

    /// Bound TCP address, if this is a TCP listener
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(_) => None,
        }
    }

    /// Human-readable address for logs
    pub fn describe(&self) -> String {
        match self {
            Listener::Tcp(listener) => listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:unknown".to_string()),
            #[cfg(unix)]
            Listener::Unix(listener) => listener
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| format!("unix:{}", p.display())))
                .unwrap_or_else(|| "unix:unnamed".to_string()),
        }
    }
}

impl From<std::net::TcpListener> for Listener {
    fn from(listener: std::net::TcpListener) -> Self {
        Listener::Tcp(listener)
    }
}

#[cfg(unix)]
impl From<std::os::unix::net::UnixListener> for Listener {
    fn from(listener: std::os::unix::net::UnixListener) -> Self {
        Listener::Unix(listener)
    }
}

#[cfg(unix)]
fn open_unix(path: &Path) -> Result<Listener, ServerError> {
    use std::os::unix::fs::PermissionsExt;

    let target = path.display().to_string();
    let listener = std::os::unix::net::UnixListener::bind(path)
        .map_err(|e| ServerError::listener(format!("socket {}", target), e))?;

    // Group writable so a reverse proxy in the same group can connect
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)).map_err(|e| {
        ServerError::listener(format!("socket {} (changing permissions)", target), e)
    })?;

    Ok(Listener::Unix(listener))
}
