//! Error types for the Windrose backup engine.

use thiserror::Error;

/// Main error type for backup operations.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Backups are disabled")]
    Disabled,

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid file path in archive")]
    InvalidArchivePath,

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Restore error: {0}")]
    Restore(String),

    #[error("Scheduler is already running")]
    SchedulerAlreadyRunning,

    #[error("Scheduler is not running")]
    SchedulerStopped,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<windrose_core::CoreError> for BackupError {
    fn from(err: windrose_core::CoreError) -> Self {
        match err {
            windrose_core::CoreError::Cancelled => BackupError::Cancelled,
            other => BackupError::Database(other.to_string()),
        }
    }
}

/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;
