use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::{FailureKind, SupervisorError};
use crate::executor::{CommandExecutor, ExecutorStatus};
use crate::live::{Broadcaster, ISSUES_CHANGED};
use crate::supervisor::CommandResult;

// ── Shared application state ──────────────────────────────────────────

#[derive(Clone)]
pub struct ApiState {
    pub executor: Arc<dyn CommandExecutor>,
    pub broadcaster: Broadcaster,
}

// ── Request / response payloads ───────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub args: Vec<String>,
    pub timeout_ms: Option<u64>,
    /// Broadcast `issues:changed` after a successful run. Defaults to true.
    pub notify: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub executor: ExecutorStatus,
    pub clients: usize,
}

// ── Error type ────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Command(SupervisorError),
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        ApiError::Command(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::BadRequest(msg) => {
                return (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response();
            }
            ApiError::Command(err) => err,
        };

        let kind = err.kind();
        let status = match kind {
            FailureKind::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            FailureKind::CommandFailed => StatusCode::BAD_GATEWAY,
            FailureKind::BinaryMissing => StatusCode::INTERNAL_SERVER_ERROR,
            FailureKind::Cancelled => StatusCode::CONFLICT,
        };
        let mut body = json!({"error": err.to_string(), "kind": kind});
        match &err {
            SupervisorError::ProcessExit { result, .. } => {
                body["exit_code"] = json!(result.exit_code);
                body["stdout"] = json!(result.stdout);
                body["stderr"] = json!(result.stderr);
            }
            SupervisorError::Timeout { stdout, stderr, .. } => {
                body["timed_out"] = json!(true);
                body["stdout"] = json!(stdout);
                body["stderr"] = json!(stderr);
            }
            _ => {}
        }

        let mut response = (status, Json(body)).into_response();
        if let SupervisorError::CircuitOpen { retry_after, .. } = &err {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(*retry_after)));
        }
        response
    }
}

/// Whole seconds for `Retry-After`, rounded up and never zero.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let ms = retry_after.as_millis() as u64;
    ms.div_ceil(1000).max(1)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/commands", post(run_command))
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        executor: state.executor.status(),
        clients: state.broadcaster.client_count(),
    })
}

async fn run_command(
    State(state): State<ApiState>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<CommandResult>, ApiError> {
    if req.args.is_empty() {
        return Err(ApiError::BadRequest("args must not be empty".into()));
    }
    if req.timeout_ms == Some(0) {
        return Err(ApiError::BadRequest("timeout_ms must be positive".into()));
    }

    let timeout = req.timeout_ms.map(Duration::from_millis);
    let command = state.executor.command(req.args.clone(), timeout);
    let result = state.executor.execute(command).await?;

    if req.notify.unwrap_or(true) {
        let delivered = state
            .broadcaster
            .broadcast(ISSUES_CHANGED, json!({"args": req.args}));
        tracing::debug!(delivered, "announced issue change");
    }
    Ok(Json(result))
}
