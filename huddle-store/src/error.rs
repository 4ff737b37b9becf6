use huddle_e2e::E2eError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid stored JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    E2e(#[from] E2eError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid message row: {0}")]
    InvalidRow(String),

    #[error("Database task failed: {0}")]
    Task(String),
}

impl From<StoreError> for E2eError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::E2e(inner) => inner,
            other => E2eError::Backend(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
