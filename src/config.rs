//! Configuration loading and constants.
//!
//! Loads server configuration from TOML files and defines constants for
//! static asset cache policies, the fixed operational endpoints, logging
//! defaults and default paths. `ServerConfig` is the root configuration struct;
//! it is read once at startup and shared read-only afterwards.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use const_format::formatcp;
use serde::Deserialize;

// =============================================================================
// Static Asset Cache Control
// =============================================================================
// Versioned build output is content-hashed, so it can be cached for a year.
// Everything else under the static root may change between deploys.

/// Versioned build assets - one year, never revalidated
pub const HTTP_CACHE_BUILD_MAX_AGE: u32 = 31_536_000;

/// Other static assets - one hour
pub const HTTP_CACHE_STATIC_MAX_AGE: u32 = 3600;

pub const CACHE_CONTROL_BUILD: &str =
    formatcp!("public, max-age={}, immutable", HTTP_CACHE_BUILD_MAX_AGE);

pub const CACHE_CONTROL_STATIC: &str = formatcp!("public, max-age={}", HTTP_CACHE_STATIC_MAX_AGE);

/// Development builds must always be refetched
pub const CACHE_CONTROL_DEVELOPMENT: &str = "max-age=0, must-revalidate, no-cache";

// =============================================================================
// Operational Endpoints
// =============================================================================

/// Liveness probe path
pub const HEALTHZ_PATH: &str = "/healthz";

/// Readiness probe path
pub const API_HEALTH_PATH: &str = "/api/health";

/// Prometheus exposition path
pub const METRICS_PATH: &str = "/metrics";

/// Body returned by the liveness probe
pub const HEALTHZ_BODY: &str = "Ok";

/// How long a readiness probe result is reused before persistence is pinged again
pub const DATABASE_HEALTH_CACHE_TTL: Duration = Duration::from_secs(5);

// =============================================================================
// Request Headers
// =============================================================================

/// Correlation header, honoured on requests and echoed on responses
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Clients send `X-Portico-NoCache: true` to bypass server-side caches
pub const NO_CACHE_HEADER: &str = "x-portico-nocache";

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Directory below the static root holding server-rendered views
pub const VIEWS_DIR: &str = "views";

/// Glob (relative to the views directory) for template files
pub const TEMPLATE_GLOB: &str = "**/*.html";

/// Shell page rendered for unmatched browser routes
pub const INDEX_TEMPLATE: &str = "index.html";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "portico=info,tower_http=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Default Unix socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/portico.sock";

/// Default content security policy, `$NONCE` and `$ROOT_PATH` are substituted per request
pub const DEFAULT_CSP_TEMPLATE: &str = "script-src 'self' 'unsafe-eval' 'unsafe-inline' 'strict-dynamic' $NONCE;object-src 'none';font-src 'self';style-src 'self' 'unsafe-inline' blob:;img-src * data:;base-uri 'self';connect-src 'self';manifest-src 'self';media-src 'none';form-action 'self';";

/// Transport selected by `server.protocol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Protocol {
    Http,
    Https,
    H2,
    Socket,
}

impl Protocol {
    /// Whether the protocol is served through the TLS code path
    pub fn is_tls(self) -> bool {
        matches!(self, Protocol::Https | Protocol::H2)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::H2 => "h2",
            Protocol::Socket => "socket",
        };
        f.write_str(s)
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "h2" => Ok(Protocol::H2),
            "socket" => Ok(Protocol::Socket),
            other => Err(ConfigError::Validation(format!("invalid protocol {:?}", other))),
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Deployment environment; development disables static asset caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listener, transport and request pipeline settings
    pub server: HttpSettings,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and pipeline settings
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "HttpSettings::default_protocol")]
    pub protocol: Protocol,
    /// Bind host; empty means all interfaces
    #[serde(default)]
    pub http_addr: String,
    #[serde(default = "HttpSettings::default_port")]
    pub http_port: u16,
    /// Certificate chain (PEM), required for https and h2
    #[serde(default)]
    pub cert_file: String,
    /// Private key (PEM), required for https and h2
    #[serde(default)]
    pub cert_key: String,
    /// Unix socket path, used by the socket protocol
    #[serde(default = "HttpSettings::default_socket")]
    pub socket: PathBuf,
    /// Maximum time to read request headers; 0 disables the limit
    #[serde(default)]
    pub read_timeout_seconds: u64,
    #[serde(default = "HttpSettings::default_domain")]
    pub domain: String,
    /// Redirect requests whose Host differs from `domain`
    #[serde(default)]
    pub enforce_domain: bool,
    /// Public URL of the server; derived from protocol, domain and port when unset
    pub root_url: Option<String>,
    /// Sub path the server is reachable under, e.g. "/portico"
    #[serde(default)]
    pub app_sub_url: String,
    /// Strip `app_sub_url` from incoming paths before routing
    #[serde(default)]
    pub serve_from_sub_path: bool,
    #[serde(default)]
    pub enable_gzip: bool,
    /// Log every request at info level instead of only failures
    #[serde(default)]
    pub router_logging: bool,
    #[serde(default = "HttpSettings::default_static_root")]
    pub static_root_path: PathBuf,
}

impl HttpSettings {
    fn default_protocol() -> Protocol {
        Protocol::Http
    }

    fn default_port() -> u16 {
        3000
    }

    fn default_socket() -> PathBuf {
        PathBuf::from(DEFAULT_SOCKET_PATH)
    }

    fn default_domain() -> String {
        "localhost".to_string()
    }

    fn default_static_root() -> PathBuf {
        PathBuf::from("public")
    }

    /// `host:port` to bind, with IPv6 brackets accepted in `http_addr`
    pub fn bind_address(&self) -> String {
        let host = self
            .http_addr
            .trim_start_matches('[')
            .trim_end_matches(']');
        if host.contains(':') {
            format!("[{}]:{}", host, self.http_port)
        } else if host.is_empty() {
            format!("0.0.0.0:{}", self.http_port)
        } else {
            format!("{}:{}", host, self.http_port)
        }
    }

    /// Header read timeout, `None` when disabled
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_seconds > 0).then(|| Duration::from_secs(self.read_timeout_seconds))
    }

    /// Public root URL without a trailing slash
    pub fn root_url(&self) -> String {
        match &self.root_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let scheme = if self.protocol.is_tls() { "https" } else { "http" };
                format!(
                    "{}://{}:{}{}",
                    scheme, self.domain, self.http_port, self.app_sub_url
                )
            }
        }
    }

    /// Directory holding server-rendered views
    pub fn views_path(&self) -> PathBuf {
        self.static_root_path.join(VIEWS_DIR)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub env: Environment,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "MetricsConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub basic_auth_username: String,
    #[serde(default)]
    pub basic_auth_password: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            basic_auth_username: String::new(),
            basic_auth_password: String::new(),
        }
    }
}

impl MetricsConfig {
    fn default_enabled() -> bool {
        true
    }

    /// Basic auth is only enforced when both credentials are set
    pub fn basic_auth_enabled(&self) -> bool {
        !self.basic_auth_username.is_empty() && !self.basic_auth_password.is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    /// Omit version and commit from the readiness payload
    #[serde(default)]
    pub hide_version: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub allow_embedding: bool,
    #[serde(default = "SecurityConfig::enabled")]
    pub content_type_protection: bool,
    #[serde(default = "SecurityConfig::enabled")]
    pub x_xss_protection: bool,
    #[serde(default)]
    pub strict_transport_security: bool,
    #[serde(default = "SecurityConfig::default_hsts_max_age")]
    pub strict_transport_security_max_age: u64,
    #[serde(default)]
    pub content_security_policy: bool,
    #[serde(default = "SecurityConfig::default_csp_template")]
    pub content_security_policy_template: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allow_embedding: false,
            content_type_protection: true,
            x_xss_protection: true,
            strict_transport_security: false,
            strict_transport_security_max_age: Self::default_hsts_max_age(),
            content_security_policy: false,
            content_security_policy_template: Self::default_csp_template(),
        }
    }
}

impl SecurityConfig {
    fn enabled() -> bool {
        true
    }

    fn default_hsts_max_age() -> u64 {
        86400
    }

    fn default_csp_template() -> String {
        DEFAULT_CSP_TEMPLATE.to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory of locally uploaded images
    #[serde(default = "PathsConfig::default_images_dir")]
    pub images_dir: PathBuf,
    /// "local" exposes `images_dir` under /public/img/attachments
    #[serde(default)]
    pub image_upload_provider: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            images_dir: Self::default_images_dir(),
            image_upload_provider: String::new(),
        }
    }
}

impl PathsConfig {
    fn default_images_dir() -> PathBuf {
        PathBuf::from("data/png")
    }
}

/// Graceful shutdown bounds
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// How long in-flight requests may run after cancellation before connections are closed
    #[serde(default = "ShutdownConfig::default_grace_period")]
    pub grace_period_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: Self::default_grace_period(),
        }
    }
}

impl ShutdownConfig {
    fn default_grace_period() -> u64 {
        30
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate a configuration document
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let mut config: ServerConfig = toml::from_str(contents)?;
        config.server.app_sub_url = normalize_sub_url(&config.server.app_sub_url);

        if config.logging.format != "text" && config.logging.format != "json" {
            return Err(ConfigError::Validation(format!(
                "invalid logging.format {:?}, expected \"text\" or \"json\"",
                config.logging.format
            )));
        }

        if config.server.serve_from_sub_path && config.server.app_sub_url.is_empty() {
            tracing::warn!("serve_from_sub_path is enabled but app_sub_url is empty");
        }

        Ok(config)
    }

    /// Configuration for a plain HTTP server on the given port with defaults elsewhere
    pub fn with_defaults(static_root_path: impl Into<PathBuf>) -> Self {
        Self {
            server: HttpSettings {
                protocol: Protocol::Http,
                http_addr: String::new(),
                http_port: HttpSettings::default_port(),
                cert_file: String::new(),
                cert_key: String::new(),
                socket: HttpSettings::default_socket(),
                read_timeout_seconds: 0,
                domain: HttpSettings::default_domain(),
                enforce_domain: false,
                root_url: None,
                app_sub_url: String::new(),
                serve_from_sub_path: false,
                enable_gzip: false,
                router_logging: false,
                static_root_path: static_root_path.into(),
            },
            environment: EnvironmentConfig::default(),
            metrics: MetricsConfig::default(),
            health: HealthConfig::default(),
            security: SecurityConfig::default(),
            paths: PathsConfig::default(),
            shutdown: ShutdownConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment.env == Environment::Development
    }
}

/// "/sub/" and "sub" both become "/sub"; "/" becomes ""
fn normalize_sub_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ServerConfig::from_toml("[server]\n").unwrap();
        assert_eq!(config.server.protocol, Protocol::Http);
        assert_eq!(config.server.http_port, 3000);
        assert_eq!(config.environment.env, Environment::Production);
        assert!(config.metrics.enabled);
        assert!(!config.metrics.basic_auth_enabled());
        assert_eq!(config.shutdown.grace_period(), Duration::from_secs(30));
        assert_eq!(config.server.read_timeout(), None);
    }

    #[test]
    fn test_unknown_protocol_is_rejected() {
        let err = ServerConfig::from_toml("[server]\nprotocol = \"gopher\"\n").unwrap_err();
        assert!(err.to_string().contains("gopher"));
    }

    #[test]
    fn test_protocols_parse() {
        assert_eq!("h2".parse::<Protocol>().unwrap(), Protocol::H2);
        assert_eq!("socket".parse::<Protocol>().unwrap(), Protocol::Socket);
        assert!(Protocol::Https.is_tls());
        assert!(!Protocol::Socket.is_tls());
    }

    #[test]
    fn test_sub_url_is_normalized() {
        assert_eq!(normalize_sub_url("/portico/"), "/portico");
        assert_eq!(normalize_sub_url("portico"), "/portico");
        assert_eq!(normalize_sub_url("/"), "");
    }

    #[test]
    fn test_bind_address_strips_ipv6_brackets() {
        let mut config = ServerConfig::with_defaults("public");
        config.server.http_addr = "[::1]".to_string();
        config.server.http_port = 8080;
        assert_eq!(config.server.bind_address(), "[::1]:8080");

        config.server.http_addr = "127.0.0.1".to_string();
        assert_eq!(config.server.bind_address(), "127.0.0.1:8080");

        config.server.http_addr = String::new();
        assert_eq!(config.server.bind_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_basic_auth_requires_both_credentials() {
        let config = ServerConfig::from_toml(
            "[server]\n[metrics]\nbasic_auth_username = \"prom\"\n",
        )
        .unwrap();
        assert!(!config.metrics.basic_auth_enabled());
    }

    #[test]
    fn test_invalid_log_format_is_rejected() {
        let err = ServerConfig::from_toml("[server]\n[logging]\nformat = \"xml\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_build_cache_header_is_one_year() {
        assert_eq!(CACHE_CONTROL_BUILD, "public, max-age=31536000, immutable");
        assert_eq!(CACHE_CONTROL_STATIC, "public, max-age=3600");
    }
}
