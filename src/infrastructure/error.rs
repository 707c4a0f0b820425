use crate::domain::recurrence::RecurrenceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Recurrence error: {0}")]
    Recurrence(#[from] RecurrenceError),
    #[error("OAuth error: {0}")]
    OAuth(String),
    #[error("OAuth grant revoked: {0}")]
    InvalidGrant(String),
    #[error("Credential store error: {0}")]
    Credential(String),
    #[error("Calendar provider error: {0}")]
    Provider(String),
    #[error("Calendar resource not found: {0}")]
    NotFound(String),
    #[error("Task not found: {0}")]
    TaskNotFound(String),
    #[error("Calendar sync unavailable: {0}")]
    SyncUnavailable(String),
}
