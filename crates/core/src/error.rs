pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("network offline")]
    Offline,

    #[error("session init failed: {message}")]
    SessionInit { message: String },

    #[error("chunk upload failed: {message}")]
    ChunkUpload { message: String },

    #[error("finalize failed: {message}")]
    Finalize { message: String },

    #[error("max retry attempts reached for task {task_id}. last error: {last_error}")]
    RetryBudgetExhausted { task_id: String, last_error: String },

    #[error("task {task_id} is already being retried")]
    RetryInProgress { task_id: String },

    #[error("cancelled")]
    Cancelled,

    #[error("persistence failed: {message}")]
    Persistence { message: String },

    #[error("request timeout")]
    Timeout,

    #[error("http error: {message}")]
    Http { message: String },

    #[error("file source unavailable (re-add the file): {file_id}")]
    SourceUnavailable { file_id: String },

    #[error("no active upload queue")]
    NoQueue,

    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::Offline => "upload.offline",
            Error::SessionInit { .. } => "upload.session_init_failed",
            Error::ChunkUpload { .. } => "upload.chunk_upload_failed",
            Error::Finalize { .. } => "upload.finalize_failed",
            Error::RetryBudgetExhausted { .. } => "retry.budget_exhausted",
            Error::RetryInProgress { .. } => "retry.in_progress",
            Error::Cancelled => "upload.cancelled",
            Error::Persistence { .. } => "progress.persistence_failed",
            Error::Timeout => "transport.timeout",
            Error::Http { .. } => "transport.http",
            Error::SourceUnavailable { .. } => "upload.source_unavailable",
            Error::NoQueue => "queue.missing",
            Error::InvalidConfig { .. } => "config.invalid",
            Error::Io(_) => "io",
            Error::Sqlite(_) | Error::SqliteMigrate(_) => "sqlite",
            Error::Json(_) => "json",
        }
    }
}
