//! HTTP request handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use chrono::{DateTime, Utc};
use futures::future;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use tracing::warn;

use crate::engine::{EngineState, ExitReason};
use crate::error::BridgeResult;
use crate::framer::FrameEvent;
use crate::router::Envelope;
use crate::state::BridgeState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `healthy` while the engine runs, `degraded` otherwise.
    pub status: &'static str,
    /// Supervisor state.
    pub state: EngineState,
    /// Engine restarts so far.
    pub restart_count: u64,
    /// Configured engine executable.
    pub engine_path: String,
    /// Listen port.
    pub port: u16,
    /// PID of the running engine.
    pub pid: Option<u32>,
    /// Start time of the running engine.
    pub engine_started_at: Option<DateTime<Utc>>,
    /// Why the previous engine stopped.
    pub last_exit: Option<ExitReason>,
    /// Attached streaming clients.
    pub subscribers: usize,
    /// Clients evicted for reading too slowly.
    pub evicted_clients: u64,
    /// Bridge uptime in seconds.
    pub uptime_secs: u64,
}

/// Body returned for an accepted submission.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    /// Always `accepted`.
    pub status: &'static str,
}

/// Handle GET /health.
pub async fn health_check(State(state): State<Arc<BridgeState>>) -> Json<HealthResponse> {
    let engine = state.engine_status();
    Json(HealthResponse {
        status: if engine.state.is_running() {
            "healthy"
        } else {
            "degraded"
        },
        state: engine.state,
        restart_count: engine.restart_count,
        engine_path: state.config().engine_path.display().to_string(),
        port: state.config().port(),
        pid: engine.pid,
        engine_started_at: engine.engine_started_at,
        last_exit: engine.last_exit,
        subscribers: state.hub().subscriber_count(),
        evicted_clients: state.hub().evicted_count(),
        uptime_secs: state.uptime_secs(),
    })
}

/// Handle POST /message - forward one envelope to the engine.
pub async fn submit_message(
    State(state): State<Arc<BridgeState>>,
    body: Bytes,
) -> BridgeResult<(StatusCode, Json<SubmitResponse>)> {
    let envelope = Envelope::from_slice(&body)?;
    state.submit(&envelope)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { status: "accepted" })))
}

/// Handle GET /sse - stream engine output.
pub async fn stream_events(
    State(state): State<Arc<BridgeState>>,
) -> BridgeResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let subscription = state.subscribe()?;
    let stream = subscription.filter_map(|event| future::ready(to_sse_event(&event).map(Ok)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.config().keep_alive_interval)))
}

/// Render one hub event; events that cannot be serialized are logged and skipped.
fn to_sse_event(event: &FrameEvent) -> Option<Event> {
    match event.to_data() {
        Ok(data) => Some(Event::default().event(event.kind()).data(data)),
        Err(e) => {
            warn!(kind = event.kind(), error = %e, "failed to serialize event, skipping");
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::error::BridgeError;
    use crate::framer::ParseFailure;
    use serde_json::json;

    fn make_test_state() -> Arc<BridgeState> {
        let config = BridgeConfig::new("cat", "127.0.0.1:8123".parse().unwrap());
        Arc::new(BridgeState::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_health_before_start() {
        let state = make_test_state();
        let response = health_check(State(state)).await;

        assert_eq!(response.status, "degraded");
        assert_eq!(response.state, EngineState::Starting);
        assert_eq!(response.restart_count, 0);
        assert_eq!(response.port, 8123);
        assert_eq!(response.engine_path, "cat");
        assert!(response.pid.is_none());
    }

    #[tokio::test]
    async fn test_submit_malformed_body() {
        let state = make_test_state();

        let result = submit_message(State(state), Bytes::from_static(b"{oops")).await;

        assert!(matches!(result, Err(BridgeError::InvalidEnvelope(_))));
    }

    #[tokio::test]
    async fn test_submit_without_engine() {
        let state = make_test_state();

        let result = submit_message(State(state), Bytes::from_static(b"{}")).await;

        assert!(matches!(result, Err(BridgeError::EngineUnavailable(_))));
    }

    #[tokio::test]
    async fn test_stream_refused_after_close() {
        let state = make_test_state();
        state.close_intake();

        let result = stream_events(State(state)).await;

        assert!(matches!(result, Err(BridgeError::ShuttingDown)));
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            state: EngineState::Running,
            restart_count: 2,
            engine_path: "/usr/bin/engine".into(),
            port: 8000,
            pid: Some(42),
            engine_started_at: None,
            last_exit: Some(ExitReason::Exited { code: 1 }),
            subscribers: 3,
            evicted_clients: 0,
            uptime_secs: 60,
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["state"], "running");
        assert_eq!(json["restart_count"], 2);
        assert_eq!(json["last_exit"]["code"], 1);
    }

    #[tokio::test]
    async fn test_stream_renders_frames_and_parse_errors() {
        use axum::response::IntoResponse;
        use http_body_util::BodyExt;

        let state = make_test_state();
        let sse = stream_events(State(state.clone())).await.unwrap();
        let mut body = sse.into_response().into_body();

        state.hub().broadcast(FrameEvent::Frame(json!({"id": 1})));
        state.hub().broadcast(FrameEvent::Malformed(ParseFailure {
            raw: "x".into(),
            error: "bad".into(),
        }));
        state.close_intake();

        let mut text = String::new();
        while let Some(frame) = body.frame().await {
            if let Ok(chunk) = frame.unwrap().into_data() {
                text.push_str(std::str::from_utf8(&chunk).unwrap());
            }
        }

        assert_eq!(
            text,
            "event: frame\ndata: {\"id\":1}\n\n\
             event: parse_error\ndata: {\"raw\":\"x\",\"error\":\"bad\"}\n\n"
        );
    }
}
