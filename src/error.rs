//! Engine error type.

use thiserror::Error;

/// Errors produced by the risk engine and its hazard store.
///
/// A failed lookup is never folded into a zero score: callers must be able
/// to tell "no hazards" (an empty result) apart from any of these.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("hazard store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("query cancelled")]
    Cancelled,
}

pub type EngineResult<T> = Result<T, EngineError>;
