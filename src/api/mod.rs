//! Local read API over the directory, plus the time-report intake.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::Error;
use crate::storage::repository::{self, NewOutboxEntry};
use crate::sync::CheckpointPolicy;
use crate::NotionSync;

/// Application state shared across handlers
pub struct AppState {
    pub sync: Arc<NotionSync>,
    /// Static bearer token; when unset every authenticated route is refused.
    pub api_token: Option<String>,
}

impl AppState {
    pub fn new(sync: Arc<NotionSync>, api_token: Option<String>) -> Arc<Self> {
        Arc::new(Self { sync, api_token })
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/employees", get(employees))
        .route("/projects", get(projects))
        .route("/tasks", get(tasks))
        .route("/review", get(review))
        .route("/sync", patch(trigger_sync))
        .route("/time", post(report_time))
        .route("/mindmap", post(import_mindmap))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "notionsync",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

fn is_public(method: &Method, path: &str) -> bool {
    path == "/health" || (method == Method::POST && path == "/time")
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    if is_public(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match (token, state.api_token.as_deref()) {
        (Some(given), Some(expected)) if given == expected => next.run(request).await,
        _ => ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token")
            .into_response(),
    }
}

fn required<'a>(params: &'a HashMap<String, String>, name: &str) -> Result<&'a str, ApiError> {
    params
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, format!("{name} is required")))
}

async fn employees(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let rows = state
        .sync
        .db()
        .reader()
        .call(|conn| repository::list_employees(conn))
        .await
        .map_err(Error::from)?;
    Ok(Json(rows).into_response())
}

async fn projects(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    required(&params, "user_id")?;
    let rows = state
        .sync
        .db()
        .reader()
        .call(|conn| repository::list_directory_projects(conn))
        .await
        .map_err(Error::from)?;
    Ok(Json(rows).into_response())
}

async fn tasks(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let user_id = required(&params, "user_id")?.to_string();
    let project_id = required(&params, "project_id")?.to_string();
    let statuses = state.sync.settings().await?.open_task_statuses;
    let rows = state
        .sync
        .db()
        .reader()
        .call(move |conn| repository::list_open_tasks(conn, &user_id, &project_id, &statuses))
        .await
        .map_err(Error::from)?;
    Ok(Json(rows).into_response())
}

async fn review(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let rows = state
        .sync
        .db()
        .reader()
        .call(|conn| repository::list_review_rows(conn, true))
        .await
        .map_err(Error::from)?;
    Ok(Json(rows).into_response())
}

/// Start a background sync; a run already in flight is a conflict.
async fn trigger_sync(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let options = state
        .sync
        .settings()
        .await?
        .sync_options(CheckpointPolicy::default(), None);
    state.sync.spawn_actualize(options).await?;
    log::info!("sync triggered over HTTP");
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "started" }))).into_response())
}

#[derive(Debug, Deserialize)]
struct TimeReport {
    #[serde(rename = "taskID")]
    task_id: String,
    #[serde(rename = "employeeID")]
    employee_id: String,
    /// Seconds.
    duration: i64,
    #[serde(default)]
    description: String,
}

async fn report_time(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response, ApiError> {
    let report: TimeReport = serde_json::from_slice(&body)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("malformed body: {e}")))?;
    if report.task_id.trim().is_empty() || report.employee_id.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "taskID and employeeID are required",
        ));
    }
    if report.duration <= 0 {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "duration must be a positive number of seconds",
        ));
    }

    let id = state
        .sync
        .enqueue_time(NewOutboxEntry {
            task_id: report.task_id,
            employee_id: report.employee_id,
            duration_secs: report.duration,
            description: report.description,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))).into_response())
}

/// Create source tasks from a markdown outline sent as the request body.
async fn import_mindmap(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let markdown = std::str::from_utf8(&body)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "outline must be UTF-8 text"))?;
    let report = state.sync.mindmap_import(markdown).await?;
    Ok((StatusCode::CREATED, Json(report)).into_response())
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match err {
            Error::AlreadySyncing(_) => StatusCode::CONFLICT,
            Error::InvalidIdentifier(_) | Error::UrlParse(_) | Error::Mapping(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            log::error!("API error: {}", self.message);
        } else {
            log::debug!("API {}: {}", self.status, self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
