//! rustls server configuration for the `https` and `h2` protocols.
//!
//! Both modes pin TLS 1.2 as the minimum version and restrict the provider to
//! a fixed cipher-suite allow-list:
//! - `https`: AES-GCM suites only, ALPN advertises `http/1.1` so clients never
//!   negotiate an upgrade to HTTP/2
//! - `h2`: AES-GCM and CHACHA20-POLY1305 suites, ALPN advertises `h2` then
//!   `http/1.1`

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::aws_lc_rs::{self, cipher_suite};
use rustls::crypto::CryptoProvider;
use rustls::{ServerConfig, SupportedCipherSuite};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::{HttpSettings, Protocol};
use crate::error::ServerError;

/// Allow-list for the `https` protocol
pub fn https_cipher_suites() -> Vec<SupportedCipherSuite> {
    vec![
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    ]
}

/// Allow-list for the `h2` protocol
pub fn h2_cipher_suites() -> Vec<SupportedCipherSuite> {
    vec![
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

/// Cipher suites and ALPN identifiers for a TLS protocol.
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    pub cipher_suites: Vec<SupportedCipherSuite>,
    pub alpn: &'static [&'static [u8]],
}

impl TlsPolicy {
    /// Policy for `protocol`, `None` for the plain-text protocols
    pub fn for_protocol(protocol: Protocol) -> Option<Self> {
        match protocol {
            Protocol::Https => Some(Self {
                cipher_suites: https_cipher_suites(),
                alpn: &[b"http/1.1"],
            }),
            Protocol::H2 => Some(Self {
                cipher_suites: h2_cipher_suites(),
                alpn: &[b"h2", b"http/1.1"],
            }),
            Protocol::Http | Protocol::Socket => None,
        }
    }

    fn provider(&self) -> Arc<CryptoProvider> {
        Arc::new(CryptoProvider {
            cipher_suites: self.cipher_suites.clone(),
            ..aws_lc_rs::default_provider()
        })
    }

    /// Builds a rustls server configuration from PEM files.
    pub fn server_config(
        &self,
        cert_file: &Path,
        key_file: &Path,
    ) -> Result<Arc<ServerConfig>, ServerError> {
        let (certs, key) = load_pem(cert_file, key_file)?;

        let mut config = ServerConfig::builder_with_provider(self.provider())
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        config.alpn_protocols = self.alpn.iter().map(|p| p.to_vec()).collect();

        Ok(Arc::new(config))
    }
}

/// Checks that certificate and key are configured and exist on disk.
///
/// Runs before any listener is opened so a bad TLS setup never leaves a
/// socket behind.
pub fn check_cert_files(settings: &HttpSettings) -> Result<(), ServerError> {
    let mode = settings.protocol.to_string().to_uppercase();
    if settings.cert_file.is_empty() {
        return Err(ServerError::Configuration(format!(
            "cert_file cannot be empty when using {}",
            mode
        )));
    }
    if settings.cert_key.is_empty() {
        return Err(ServerError::Configuration(format!(
            "cert_key cannot be empty when using {}",
            mode
        )));
    }
    for (what, path) in [("SSL cert_file", &settings.cert_file), ("SSL key_file", &settings.cert_key)] {
        let path = Path::new(path);
        if !path.is_file() {
            return Err(ServerError::FileNotFound {
                what,
                path: path.to_path_buf(),
            });
        }
    }
    Ok(())
}

fn load_pem(
    cert_file: &Path,
    key_file: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ServerError> {
    let certs = CertificateDer::pem_file_iter(cert_file)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| {
            ServerError::Configuration(format!(
                "failed to read certificates from {}: {}",
                cert_file.display(),
                e
            ))
        })?;
    if certs.is_empty() {
        return Err(ServerError::Configuration(format!(
            "no certificates found in {}",
            cert_file.display()
        )));
    }

    let key = PrivateKeyDer::from_pem_file(key_file).map_err(|e| {
        ServerError::Configuration(format!(
            "failed to read private key from {}: {}",
            key_file.display(),
            e
        ))
    })?;

    Ok((certs, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn tls_settings(protocol: Protocol, cert: &str, key: &str) -> HttpSettings {
        let mut config = ServerConfig::with_defaults("public");
        config.server.protocol = protocol;
        config.server.cert_file = cert.to_string();
        config.server.cert_key = key.to_string();
        config.server
    }

    #[test]
    fn test_empty_cert_path_is_configuration_error() {
        let err = check_cert_files(&tls_settings(Protocol::Https, "", "key.pem")).unwrap_err();
        assert!(matches!(err, ServerError::Configuration(ref msg) if msg.contains("cert_file")));

        let err = check_cert_files(&tls_settings(Protocol::H2, "cert.pem", "")).unwrap_err();
        assert!(matches!(err, ServerError::Configuration(ref msg) if msg.contains("cert_key")));
    }

    #[test]
    fn test_missing_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        std::fs::write(&cert, "").unwrap();
        let key = dir.path().join("missing-key.pem");

        let err = check_cert_files(&tls_settings(
            Protocol::H2,
            cert.to_str().unwrap(),
            key.to_str().unwrap(),
        ))
        .unwrap_err();
        assert!(matches!(err, ServerError::FileNotFound { what: "SSL key_file", .. }));
    }

    #[test]
    fn test_policies() {
        let https = TlsPolicy::for_protocol(Protocol::Https).unwrap();
        assert_eq!(https.alpn, &[b"http/1.1" as &[u8]]);
        assert!(!https
            .cipher_suites
            .iter()
            .any(|s| *s == cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256));

        let h2 = TlsPolicy::for_protocol(Protocol::H2).unwrap();
        assert_eq!(h2.alpn, &[b"h2" as &[u8], b"http/1.1"]);

        assert!(TlsPolicy::for_protocol(Protocol::Http).is_none());
        assert!(TlsPolicy::for_protocol(Protocol::Socket).is_none());
    }

    #[test]
    fn test_garbage_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "not a pem").unwrap();
        std::fs::write(&key, "also not a pem").unwrap();

        let policy = TlsPolicy::for_protocol(Protocol::Https).unwrap();
        assert!(policy.server_config(&cert, &key).is_err());
    }

    #[test]
    fn test_server_config_carries_alpn() {
        let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
        let cert = fixtures.join("localhost.crt");
        let key = fixtures.join("localhost.key");

        let https = TlsPolicy::for_protocol(Protocol::Https)
            .unwrap()
            .server_config(&cert, &key)
            .unwrap();
        assert_eq!(https.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let h2 = TlsPolicy::for_protocol(Protocol::H2)
            .unwrap()
            .server_config(&cert, &key)
            .unwrap();
        assert_eq!(h2.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}
