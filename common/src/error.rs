use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Inventory unavailable: {0}")]
    InventoryUnavailable(String),
    #[error("Inventory format error: {0}")]
    InventoryFormat(String),
    #[error("Patient {pseudonym} is already assigned to {existing}, refusing {attempted}")]
    CacheContradiction {
        pseudonym: String,
        existing: String,
        attempted: String,
    },
    #[error("Header parse error: {0}")]
    HeaderParse(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Processing error: {0}")]
    Processing(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Errors after which a run must stop instead of moving on to the next item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::InventoryUnavailable(_) | AppError::Config(_))
    }

    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, AppError::CacheContradiction { .. })
    }
}
