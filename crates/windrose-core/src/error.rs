//! Error types shared across the Windrose platform crates.

use thiserror::Error;

/// Main error type for core platform operations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
