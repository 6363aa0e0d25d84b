use std::io;
use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    Json,
};

/// Startup and serving failures surfaced by [`crate::HttpServer::run`].
///
/// A cancellation-triggered shutdown is not an error; `run` returns `Ok(())`.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("cannot find {what} at {path:?}")]
    FileNotFound { what: &'static str, path: PathBuf },

    #[error("failed to open listener on {target}: {source}")]
    Listener {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("Server error: {0}")]
    Serve(#[source] io::Error),
}

impl ServerError {
    /// Errors raised before the listener starts accepting connections
    pub fn is_startup(&self) -> bool {
        !matches!(self, ServerError::Serve(_))
    }

    pub(crate) fn listener(target: impl Into<String>, source: io::Error) -> Self {
        ServerError::Listener {
            target: target.into(),
            source,
        }
    }
}

impl From<crate::config::ConfigError> for ServerError {
    fn from(err: crate::config::ConfigError) -> Self {
        ServerError::Configuration(err.to_string())
    }
}

/// Errors produced while handling a single request.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found")]
    NotFound { api: bool },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Template rendering error: {0}")]
    Template(#[from] tera::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::NotFound { api: true } => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "message": "Not found" })),
            )
                .into_response(),
            AppError::NotFound { api: false } => {
                error_page(StatusCode::NOT_FOUND, "Page not found")
            }
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "message": "Unauthorized" })),
            )
                .into_response(),
            _ => {
                tracing::error!("Internal error: {:?}", self);
                error_page(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

fn error_page(status: StatusCode, message: &str) -> Response {
    let body = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Error {}</title>
</head>
<body>
    <h1>Error {}</h1>
    <p>{}</p>
</body>
</html>"#,
        status.as_u16(),
        status.as_u16(),
        message
    );

    (status, Html(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_errors_are_not_startup_errors() {
        let err = ServerError::Serve(io::Error::other("accept failed"));
        assert!(!err.is_startup());

        let err = ServerError::FileNotFound {
            what: "cert_file",
            path: PathBuf::from("/missing.pem"),
        };
        assert!(err.is_startup());
        assert!(err.to_string().contains("/missing.pem"));
    }

    #[test]
    fn test_api_not_found_is_json() {
        let response = AppError::NotFound { api: true }.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[axum::http::header::CONTENT_TYPE],
            "application/json"
        );
    }

    #[test]
    fn test_internal_error_hides_details() {
        let response = AppError::Internal("database exploded".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
