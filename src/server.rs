//! HTTP surfaces: the session/execution plane and the optional
//! inference plane.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::coordinator::{Task, TaskCoordinator, TaskError, TaskOptions};
use crate::error::Error;
use crate::llm::UsageRecord;
use crate::session::{SessionId, SessionManager};
use crate::transport::wire::{
    CreateSessionRequest, CreateSessionResponse, ErrorResponse, ExecuteRequest, SessionsResponse,
    StatusResponse,
};

/// Router hosting the session manager: `POST /session`,
/// `POST /session/{id}/execute`, `DELETE /session/{id}`, `GET /health`,
/// `GET /ready`, `GET /sessions`.
pub fn execution_router(manager: Arc<SessionManager>) -> Router {
    Router::new()
        .route("/session", post(create_session))
        .route("/session/{session_id}/execute", post(execute))
        .route("/session/{session_id}", delete(destroy_session))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/sessions", get(list_sessions))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

async fn create_session(
    State(manager): State<Arc<SessionManager>>,
    Json(body): Json<CreateSessionRequest>,
) -> Response {
    match manager.create_session(body.owner_tag).await {
        Ok(session_id) => (StatusCode::OK, Json(CreateSessionResponse { session_id })).into_response(),
        Err(Error::CapacityExhausted { .. }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "capacity_exhausted".to_string(),
            }),
        )
            .into_response(),
        Err(err) => internal_error(err),
    }
}

async fn execute(
    State(manager): State<Arc<SessionManager>>,
    Path(session_id): Path<String>,
    Json(body): Json<ExecuteRequest>,
) -> Response {
    let session_id = SessionId::from(session_id);
    match manager
        .execute(&session_id, &body.code, body.timeout_ms)
        .await
    {
        Ok(outputs) => (StatusCode::OK, Json(outputs)).into_response(),
        Err(Error::NoSuchSession { .. }) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "no_such_session".to_string(),
            }),
        )
            .into_response(),
        Err(err @ Error::CodeTooLarge { .. }) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: err.to_string(),
            }),
        )
            .into_response(),
        Err(err) => internal_error(err),
    }
}

async fn destroy_session(
    State(manager): State<Arc<SessionManager>>,
    Path(session_id): Path<String>,
) -> StatusCode {
    // Idempotent: unknown sessions also get 204.
    manager.destroy_session(&SessionId::from(session_id)).await;
    StatusCode::NO_CONTENT
}

async fn health(State(manager): State<Arc<SessionManager>>) -> Response {
    if manager.ready() {
        (
            StatusCode::OK,
            Json(StatusResponse {
                status: "ok".to_string(),
            }),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "sandbox runtime not ready".to_string(),
            }),
        )
            .into_response()
    }
}

async fn ready(State(manager): State<Arc<SessionManager>>) -> Response {
    health(State(manager)).await
}

async fn list_sessions(State(manager): State<Arc<SessionManager>>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: manager.list_sessions(),
    })
}

fn internal_error(err: Error) -> Response {
    warn!("Request failed: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

/// Inference request body.
#[derive(Debug, Clone, Deserialize)]
pub struct InferRequest {
    pub query: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_depth: Option<u32>,
}

/// Inference response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferResponse {
    pub answer: String,
    pub usage: UsageRecord,
    pub recursion_id: String,
}

#[derive(Clone)]
struct InferState {
    coordinator: Arc<TaskCoordinator>,
    default_task_timeout_ms: Option<u64>,
}

/// Router hosting `POST /infer` over a task coordinator.
pub fn inference_router(
    coordinator: Arc<TaskCoordinator>,
    default_task_timeout_ms: Option<u64>,
) -> Router {
    Router::new()
        .route("/infer", post(infer))
        .layer(TraceLayer::new_for_http())
        .with_state(InferState {
            coordinator,
            default_task_timeout_ms,
        })
}

async fn infer(State(state): State<InferState>, Json(body): Json<InferRequest>) -> Response {
    if body.query.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "query must not be empty".to_string(),
            }),
        )
            .into_response();
    }

    let mut task = Task::new(body.query).with_options(TaskOptions {
        max_depth: body.max_depth,
        root_model: body.model,
        task_timeout_ms: state.default_task_timeout_ms,
        ..TaskOptions::default()
    });
    if let Some(context) = body.context {
        task = task.with_context(context);
    }

    let handle = match state.coordinator.submit(task).await {
        Ok(handle) => handle,
        Err(err) => return internal_error(err),
    };
    let result = handle.wait().await;

    match result.error {
        None => (
            StatusCode::OK,
            Json(InferResponse {
                answer: result.answer,
                usage: result.usage_total,
                recursion_id: result.recursion_id.unwrap_or_default(),
            }),
        )
            .into_response(),
        Some(TaskError::Timeout) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(ErrorResponse {
                error: "task_timeout".to_string(),
            }),
        )
            .into_response(),
        Some(TaskError::InvalidRequest(detail)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse { error: detail }),
        )
            .into_response(),
        Some(other) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: other.to_string(),
            }),
        )
            .into_response(),
    }
}
