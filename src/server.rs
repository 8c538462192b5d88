//! HTTP 控制面
//!
//! 新建任务、查看队列、暂停和恢复调度器。

use std::path::PathBuf;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use crate::core::{DispatchError, DispatcherHandle, DispatcherStatus, NewTask, Task, TaskQueue};

#[derive(Clone)]
pub struct AppState {
    pub queue: TaskQueue,
    pub dispatcher: DispatcherHandle,
}

/// `POST /tasks` 的请求体，创建时间由队列分配
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub filename: PathBuf,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl From<CreateTaskRequest> for NewTask {
    fn from(request: CreateTaskRequest) -> Self {
        let mut task = NewTask::new(request.filename)
            .with_description(request.description)
            .with_parents(request.parents);
        task.mime_type = request.mime_type;
        task
    }
}

#[derive(Debug, Serialize)]
pub struct TaskList {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// 机器可读的错误码
    pub code: String,
    pub retryable: bool,
}

/// 把 `DispatchError` 渲染成 JSON 响应
#[derive(Debug)]
pub enum HttpError {
    Dispatch(DispatchError),
    BadRequest(String),
}

impl From<DispatchError> for HttpError {
    fn from(err: DispatchError) -> Self {
        HttpError::Dispatch(err)
    }
}

impl From<JsonRejection> for HttpError {
    fn from(rejection: JsonRejection) -> Self {
        HttpError::BadRequest(format!("Invalid request body: {}", rejection.body_text()))
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            HttpError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse { error: message, code: "request.invalid".to_string(), retryable: false },
            ),
            HttpError::Dispatch(err) => {
                let status = match &err {
                    DispatchError::InvalidTask(_) => StatusCode::BAD_REQUEST,
                    DispatchError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    tracing::error!(error = %err, code = err.code(), "Request failed");
                } else {
                    tracing::debug!(error = %err, code = err.code(), "Request rejected");
                }
                (
                    status,
                    ErrorResponse {
                        error: err.to_string(),
                        code: err.code().to_string(),
                        retryable: err.is_retryable(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// 解析失败时返回统一错误格式的 JSON 提取器
pub struct ValidatedJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: Send,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(inner) = Json::<T>::from_request(req, state).await?;
        Ok(ValidatedJson(inner))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/add", post(create_task))
        .route("/tasks/dead", get(list_dead_letters))
        .route("/status", get(status))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> &'static str {
    "uplift upload dispatcher\n"
}

#[tracing::instrument(skip(state, request), fields(filename = %request.filename.display()))]
async fn create_task(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), HttpError> {
    let task = state.queue.create(request.into()).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[tracing::instrument(skip(state))]
async fn list_tasks(State(state): State<AppState>) -> Result<Json<TaskList>, HttpError> {
    let tasks = state.queue.list().await?;
    tracing::debug!(count = tasks.len(), "Listing tasks");
    Ok(Json(TaskList { tasks }))
}

#[tracing::instrument(skip(state))]
async fn list_dead_letters(State(state): State<AppState>) -> Result<Json<TaskList>, HttpError> {
    let tasks = state.queue.dead_letters().await?;
    Ok(Json(TaskList { tasks }))
}

async fn status(State(state): State<AppState>) -> Json<DispatcherStatus> {
    Json(state.dispatcher.status())
}

async fn pause(State(state): State<AppState>) -> Json<DispatcherStatus> {
    Json(state.dispatcher.pause())
}

async fn resume(State(state): State<AppState>) -> Json<DispatcherStatus> {
    Json(state.dispatcher.resume())
}
