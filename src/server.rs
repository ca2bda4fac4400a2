//! HTTP surface: health probe, streaming invocations and stop requests.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::error::Result;
use crate::runtime::RuntimeContext;
use crate::stream::sse_frames;
use crate::turn::TurnRequest;

/// Shared state passed to the handlers.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeContext>,
}

/// Body of `POST /invocations`.
#[derive(Debug, Deserialize)]
pub struct InvocationRequest {
    #[serde(flatten)]
    pub turn: TurnRequest,
    /// Route the turn through the configured swarm.
    #[serde(default)]
    pub swarm: bool,
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub user_id: String,
    pub session_id: String,
}

pub fn build_router(runtime: Arc<RuntimeContext>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/invocations", post(invocations))
        .route("/stop", post(stop))
        .with_state(AppState { runtime })
}

/// Bind `addr` and serve until the listener fails.
pub async fn serve(addr: SocketAddr, runtime: Arc<RuntimeContext>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "server listening");
    axum::serve(listener, build_router(runtime)).await?;
    Ok(())
}

async fn ping() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Start a turn in the background and stream its events as SSE.
///
/// The turn outlives a disconnected caller so its log is still written.
async fn invocations(State(state): State<AppState>, Json(body): Json<InvocationRequest>) -> Response {
    if body.swarm && state.runtime.swarm().is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "no swarm configured" })),
        )
            .into_response();
    }

    let (sink, rx) = state.runtime.event_channel();
    let runtime = state.runtime.clone();
    let InvocationRequest { turn, swarm } = body;
    tokio::spawn(async move {
        let outcome = if swarm {
            runtime.run_swarm_turn(turn, &sink).await
        } else {
            Ok(runtime.run_turn(turn, &sink).await)
        };
        match outcome {
            Ok(outcome) => tracing::debug!(status = ?outcome.status, "invocation finished"),
            Err(e) => tracing::error!(error = %e, "invocation could not start"),
        }
    });

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(sse_frames(rx)),
    )
        .into_response()
}

async fn stop(State(state): State<AppState>, Json(body): Json<StopRequest>) -> Response {
    match state
        .runtime
        .request_stop(&body.user_id, &body.session_id)
        .await
    {
        Ok(()) => Json(json!({ "status": "stopping" })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "stop request failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
