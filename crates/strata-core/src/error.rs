//! Error types shared by the strata crates

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid attribute {name}: {value}")]
    InvalidAttr { name: String, value: String },
}

/// Result type alias
pub type CoreResult<T> = Result<T, CoreError>;
