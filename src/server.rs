//! JSON HTTP API for launching and tracking tasks.
//!
//! The server is a launcher like the CLI: `POST /tasks` validates the
//! request, inserts a `queued` record and starts a detached runner, then
//! answers immediately. Everything else reads or conditionally updates the
//! task store.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/tasks?username=` | List tasks, newest first |
//! | `GET`  | `/tasks/{id}` | One task with summary or error |
//! | `POST` | `/tasks` | Create and launch a task |
//! | `POST` | `/tasks/{id}/cancel` | Cancel a started task |
//! | `GET`  | `/summary?username=` | Task counts by status |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "invalid task parameters: client_id is empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::Path as FsPath;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::CuratorError;
use crate::runner::{self, ProcessLauncher, RunnerLauncher, TaskRequest};
use crate::task::{StatusCounts, TaskRecord, TaskStore};

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: TaskStore,
    launcher: Arc<dyn RunnerLauncher>,
}

/// Serve the API on `[server].bind` until the process is terminated.
pub async fn run_server(config: &Config, config_path: &FsPath) -> anyhow::Result<()> {
    let store = TaskStore::open(config).await?;
    let launcher = Arc::new(ProcessLauncher::current(config_path)?);
    let app = router(config.clone(), store, launcher);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// The API routes over an open store and a runner launcher.
pub fn router(config: Config, store: TaskStore, launcher: Arc<dyn RunnerLauncher>) -> Router {
    let state = AppState {
        config: Arc::new(config),
        store,
        launcher,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/tasks", get(handle_list_tasks).post(handle_create_task))
        .route("/tasks/{id}", get(handle_get_task))
        .route("/tasks/{id}/cancel", post(handle_cancel_task))
        .route("/summary", get(handle_summary))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

/// Map domain errors to their status code; anything else is a 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        match err.downcast_ref::<CuratorError>() {
            Some(CuratorError::TaskNotFound(_)) | Some(CuratorError::DatasetNotFound(_)) => {
                not_found(message)
            }
            Some(CuratorError::IllegalTransition { .. }) => AppError {
                status: StatusCode::CONFLICT,
                code: "conflict",
                message,
            },
            Some(CuratorError::InvalidParams(_))
            | Some(CuratorError::UnknownStatus(_))
            | Some(CuratorError::UnknownLabelLevel(_))
            | Some(CuratorError::Sheet(_)) => bad_request(message),
            None => {
                tracing::error!(error = %message, "request failed");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal",
                    message,
                }
            }
        }
    }
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Deserialize)]
struct UserFilter {
    username: Option<String>,
}

#[derive(Serialize)]
struct TaskListResponse {
    tasks: Vec<TaskRecord>,
}

async fn handle_list_tasks(
    State(state): State<AppState>,
    Query(filter): Query<UserFilter>,
) -> Result<Json<TaskListResponse>, AppError> {
    let tasks = state.store.list(filter.username.as_deref()).await?;
    Ok(Json(TaskListResponse { tasks }))
}

async fn handle_get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskRecord>, AppError> {
    state
        .store
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("task not found: {}", id)))
}

#[derive(Serialize)]
struct CreatedResponse {
    task_id: String,
}

async fn handle_create_task(
    State(state): State<AppState>,
    body: Result<Json<TaskRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedResponse>), AppError> {
    let Json(request) = body.map_err(|e| bad_request(e.body_text()))?;
    let task_id = runner::submit_task(
        &state.config,
        &state.store,
        state.launcher.as_ref(),
        request.into_params(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { task_id })))
}

#[derive(Serialize)]
struct CancelResponse {
    task_id: String,
    status: &'static str,
}

async fn handle_cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    state.store.cancel(&id).await?;
    Ok(Json(CancelResponse {
        task_id: id,
        status: "cancelled",
    }))
}

#[derive(Serialize)]
struct SummaryResponse {
    #[serde(flatten)]
    counts: StatusCounts,
    in_progress: i64,
}

async fn handle_summary(
    State(state): State<AppState>,
    Query(filter): Query<UserFilter>,
) -> Result<Json<SummaryResponse>, AppError> {
    let counts = state.store.status_counts(filter.username.as_deref()).await?;
    Ok(Json(SummaryResponse {
        in_progress: counts.in_progress(),
        counts,
    }))
}
