//! Turns handler panics into 500 responses.

use std::any::Any;

use axum::{
    body::Body,
    http::{header, Response, StatusCode},
};
use tower_http::catch_panic::CatchPanicLayer;

type PanicHandler = fn(Box<dyn Any + Send + 'static>) -> Response<Body>;

pub fn catch_panic_layer() -> CatchPanicLayer<PanicHandler> {
    CatchPanicLayer::custom(handle_panic as PanicHandler)
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic payload"
    };
    tracing::error!(panic = %detail, "Request handler panicked");

    let body = serde_json::json!({ "message": "Internal Server Error" }).to_string();
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Request;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn boom() -> &'static str {
        panic!("handler failed")
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_server_error() {
        let app = Router::new()
            .route("/boom", get(boom))
            .layer(catch_panic_layer());

        let response = app
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }
}
