//! Sequence error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SeqError {
    /// An invariant was violated: bad arguments, sample-count overflow,
    /// format mismatch, or a corrupt candidate block list. The sequence is
    /// left unchanged.
    #[error("Sequence inconsistency in {0}")]
    Inconsistency(String),

    #[error("Block store error: {0}")]
    Store(#[from] strata_store::StoreError),

    #[error("Malformed sequence descriptor: {0}")]
    Xml(String),
}

pub type SeqResult<T> = Result<T, SeqError>;

pub(crate) fn inconsistency(op: &str) -> SeqError {
    SeqError::Inconsistency(op.to_string())
}
