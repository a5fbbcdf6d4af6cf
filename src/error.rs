use std::io;
use thiserror::Error;

/// Everything that can go wrong while building or combining factors.
///
/// None of these are retried inside this crate. Schema and index errors mean the caller handed
/// over a key or variable that doesn't fit the factor; they indicate a bug in the calling layer,
/// not a runtime condition.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum FactorError {
    /// A key or variable list doesn't fit a factor's schema, or an operation that needs
    /// enumerable variables was invoked on an atomic factor.
    #[error("schema error: {0}")]
    Schema(String),

    /// A flat index was outside the table.
    #[error("index {index} out of range for factor of size {size}")]
    Index {
        /// The requested index.
        index: usize,
        /// The number of cells in the factor.
        size: usize,
    },

    /// The storage backing this factor can't perform the requested operation.
    #[error("{operation} is not supported by {storage} storage")]
    Unsupported {
        /// What the caller tried to do.
        operation: &'static str,
        /// Which storage strategy refused.
        storage: &'static str,
    },

    /// Every cell of the factor is zero. Only produced by
    /// [`Factor::ensure_nondegenerate`][crate::Factor::ensure_nondegenerate]; the operations
    /// themselves treat an all-zero result as a valid value.
    #[error("every cell of the factor is zero:\n{0}")]
    Degenerate(String),

    /// Parameters given for a density were not valid.
    #[error("invalid density: {0}")]
    Density(String),

    /// Tabular input could not be parsed.
    #[error("line {line}: {message}")]
    Parse {
        /// The 1-based line number where parsing failed.
        line: u64,
        /// What was wrong with that line.
        message: String,
    },

    /// Reading tabular input failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result type used throughout this crate.
pub type Result<T, E = FactorError> = std::result::Result<T, E>;

impl FactorError {
    pub(crate) fn schema(message: impl Into<String>) -> Self {
        FactorError::Schema(message.into())
    }
}
