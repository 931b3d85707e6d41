//! Block-store error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(String),

    #[error("Invalid block file: {0}")]
    InvalidBlockFile(String),

    #[error("Block data not yet available")]
    NotYetAvailable,

    #[error("Read past end of block: offset {offset} + len {len} > {block_len}")]
    ReadPastEnd {
        offset: usize,
        len: usize,
        block_len: usize,
    },

    #[error("Missing attribute: {0}")]
    MissingAttr(String),

    #[error("Invalid attribute {name}: {value}")]
    InvalidAttr { name: String, value: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<hound::Error> for StoreError {
    fn from(err: hound::Error) -> Self {
        StoreError::Wav(err.to_string())
    }
}

impl From<strata_core::CoreError> for StoreError {
    fn from(err: strata_core::CoreError) -> Self {
        match err {
            strata_core::CoreError::Io(e) => StoreError::Io(e),
            strata_core::CoreError::InvalidAttr { name, value } => {
                StoreError::InvalidAttr { name, value }
            }
        }
    }
}
