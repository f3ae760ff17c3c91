//! HTTP handlers for the downstream surface.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use toolstream_core::events::RunContext;
use toolstream_core::ids::{RunId, ThreadId};
use toolstream_core::messages::Message;
use toolstream_engine::{ChannelEmitter, Conversation};

use crate::server::AppState;

/// Body of `POST /api/chat`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub thread_id: Option<ThreadId>,
    #[serde(default)]
    pub run_id: Option<RunId>,
    pub messages: Vec<Message>,
    /// Shared state for the run. Must be a JSON object when present.
    #[serde(default)]
    pub state: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("run {0} is already active")]
    RunConflict(RunId),
    #[error("run {0} not found")]
    RunNotFound(RunId),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::RunConflict(_) => StatusCode::CONFLICT,
            Self::RunNotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Start a run and stream its events back as `text/event-stream`.
///
/// The run executes on its own task; this handler only holds the receiving
/// half of the event channel. If the client goes away the run stops at its
/// next emit.
pub async fn chat(State(app): State<AppState>, Json(req): Json<ChatRequest>) -> Result<Response, ApiError> {
    if req.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".into()));
    }
    let state = match req.state {
        None | Some(Value::Null) => json!({}),
        Some(Value::Object(map)) => Value::Object(map),
        Some(_) => return Err(ApiError::BadRequest("state must be a JSON object".into())),
    };

    let ctx = RunContext::new(req.thread_id, req.run_id);
    let guard = app
        .runs
        .register(ctx.run_id.clone())
        .ok_or_else(|| ApiError::RunConflict(ctx.run_id.clone()))?;

    info!(
        run_id = %ctx.run_id,
        thread_id = %ctx.thread_id,
        messages = req.messages.len(),
        "run accepted"
    );

    let (tx, rx) = mpsc::channel(app.send_queue);
    let runner = app.runner.clone();
    let sink = ChannelEmitter::new(tx).with_typing(app.typing);
    let mut conversation = Conversation::new(req.messages, state);

    let _task = tokio::spawn(async move {
        if let Err(e) = runner.run(&ctx, &mut conversation, &sink, guard.token()).await {
            debug!(run_id = %guard.run_id(), code = e.code(), "run ended with error");
        }
        drop(guard);
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    let headers = [
        (header::CONTENT_TYPE, "text/event-stream"),
        (header::CACHE_CONTROL, "no-cache"),
    ];
    Ok((headers, body).into_response())
}

/// `DELETE /api/runs/{run_id}`.
pub async fn cancel_run(State(app): State<AppState>, Path(run_id): Path<String>) -> Result<StatusCode, ApiError> {
    let run_id = RunId::from_raw(run_id);
    if app.runs.cancel(&run_id) {
        info!(run_id = %run_id, "run cancellation requested");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::RunNotFound(run_id))
    }
}

/// `GET /api/tools`: every registered tool with its schema and origin.
pub async fn list_tools(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.runner.registry().listings())
}

/// `GET /health`.
pub async fn health(State(app): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "activeRuns": app.runs.len(),
    }))
}
