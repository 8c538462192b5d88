use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    /// 任务参数非法，创建时直接拒绝，不会重试
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// 存储暂不可用，调用方可以整体重试
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Conflicting revision for task {0}")]
    ConflictingRevision(String),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error {0}")]
    Json(#[from] serde_json::Error),

    #[error("Sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Sqlite migrate error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl DispatchError {
    pub fn invalid_task(message: impl Into<String>) -> Self {
        Self::InvalidTask(message.into())
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable(message.into())
    }

    pub fn upload_failed(message: impl Into<String>) -> Self {
        Self::UploadFailed(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// 暂时性错误，稍后重试有机会成功
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::StoreUnavailable(_)
                | DispatchError::UploadFailed(_)
                | DispatchError::Io(_)
                | DispatchError::Http(_)
                | DispatchError::Sqlite(_)
        )
    }

    /// 删除时的良性竞争：别的调用方已经删掉或改过
    pub fn is_benign_race(&self) -> bool {
        matches!(self, DispatchError::NotFound(_) | DispatchError::ConflictingRevision(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::InvalidTask(_) => "task.invalid",
            DispatchError::StoreUnavailable(_) => "store.unavailable",
            DispatchError::ConflictingRevision(_) => "store.conflict",
            DispatchError::NotFound(_) => "task.not_found",
            DispatchError::UploadFailed(_) => "upload.failed",
            DispatchError::Cancelled => "cancelled",
            DispatchError::Config(_) => "config.invalid",
            DispatchError::Io(_) => "io",
            DispatchError::Http(_) => "http",
            DispatchError::Json(_) => "json",
            DispatchError::Sqlite(_) | DispatchError::Migrate(_) => "store.sqlite",
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
