//! Route configuration for the bridge API.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers::{health_check, stream_events, submit_message};
use crate::state::BridgeState;

/// Create the bridge router.
pub fn create_router(state: Arc<BridgeState>) -> Router {
    let body_limit = DefaultBodyLimit::max(state.config().max_line_length);
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Engine output stream
        .route("/sse", get(stream_events))
        // Client envelopes
        .route("/message", post(submit_message).layer(body_limit))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn make_test_state() -> Arc<BridgeState> {
        let config = BridgeConfig::new("cat", "127.0.0.1:0".parse().unwrap())
            .with_max_line_length(64);
        Arc::new(BridgeState::new(config).unwrap())
    }

    fn post_message(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/message")
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_router(make_test_state());

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["state"], "starting");
        assert_eq!(json["restart_count"], 0);
        assert_eq!(json["subscribers"], 0);
    }

    #[tokio::test]
    async fn test_message_without_engine() {
        let app = create_router(make_test_state());

        let response = app.oneshot(post_message(r#"{"id":1}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error"], "engine_unavailable");
    }

    #[tokio::test]
    async fn test_malformed_message() {
        let app = create_router(make_test_state());

        let response = app.oneshot(post_message("{not json")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "invalid_envelope");
    }

    #[tokio::test]
    async fn test_oversized_message() {
        let app = create_router(make_test_state());
        let body = format!(r#"{{"pad":"{}"}}"#, "x".repeat(128));

        let response = app.oneshot(post_message(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_sse_endpoint_headers() {
        let state = make_test_state();
        let app = create_router(state.clone());

        let request = Request::builder().uri("/sse").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
        assert!(content_type.to_str().unwrap().starts_with("text/event-stream"));
        assert_eq!(state.hub().subscriber_count(), 1);

        drop(response);
        assert_eq!(state.hub().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_sse_after_close() {
        let state = make_test_state();
        state.close_intake();
        let app = create_router(state);

        let request = Request::builder().uri("/sse").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error"], "shutting_down");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = create_router(make_test_state());

        let request = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_wrong_method() {
        let app = create_router(make_test_state());

        let request = Request::builder()
            .uri("/message")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
