//! Error types for the Windrose recommendation engine.

use thiserror::Error;

/// Main error type for training and prediction.
#[derive(Error, Debug)]
pub enum RecommendError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Numerical failure: {0}")]
    Numerical(String),

    #[error("Training cancelled")]
    Cancelled,
}

/// Result type alias for recommendation operations.
pub type Result<T> = std::result::Result<T, RecommendError>;
