use bbq_error::{BbqError, ErrorCodes};
use thiserror::Error;

/// Stored vectors are addressed by unsigned 64-bit ids. Ids that participate
/// in partition bitmaps must fit in 32 bits; the high bits are reserved.
pub type ID = u64;

/// A dense embedding of `d` single-precision floats.
pub type Vector = Vec<f32>;

/// An ordered set of `d` mutually orthogonal unit vectors in ℝ^d.
pub type Basis = Vec<Vector>;

/// Static facts a backend reports about itself at open time.
#[derive(Clone, Debug)]
pub struct BackendInfo {
    /// True when the backend holds a persisted basis set that a store
    /// should load instead of generating a fresh one.
    pub has_index_data: bool,
    pub dimensions: usize,
    /// Stable quantizer identifier, e.g. `"none"` or `"float16"`.
    pub quantization: String,
}

#[derive(Error, Debug)]
pub enum QuantizationError {
    #[error("cannot lower vector: {0}")]
    BadVector(&'static str),
    #[error("buffer length {actual} does not match lowered size {expected}")]
    BadBufferLength { expected: usize, actual: usize },
}

impl BbqError for QuantizationError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("id not found")]
    IdNotFound,
    #[error("vector dimension {actual} does not match store dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("backend does not support {0}")]
    IncompatibleBackend(&'static str),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Quantization(#[from] QuantizationError),
}

impl BbqError for BackendError {
    fn code(&self) -> ErrorCodes {
        match self {
            BackendError::IdNotFound => ErrorCodes::NotFound,
            BackendError::DimensionMismatch { .. } => ErrorCodes::InvalidArgument,
            BackendError::IncompatibleBackend(_) => ErrorCodes::FailedPrecondition,
            BackendError::Io(_) => ErrorCodes::Internal,
            BackendError::Quantization(_) => ErrorCodes::InvalidArgument,
        }
    }
}
