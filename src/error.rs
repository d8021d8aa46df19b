//! Error types for hitgraph.

use thiserror::Error;

/// hitgraph error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Invalid configuration (non-positive dimensions, empty layer lists, ...).
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Neighbor count exceeds the batch capacity.
    #[error("k = {k} exceeds batch capacity max_entries = {max_entries}")]
    KTooLarge { k: usize, max_entries: usize },

    /// Input tensors disagree on a dimension.
    #[error("shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A valid-entry count is larger than the batch capacity.
    #[error("batch element {batch}: valid count {count} exceeds max_entries {max_entries}")]
    ValidCountOutOfRange {
        batch: usize,
        count: usize,
        max_entries: usize,
    },

    /// A seed index lies beyond the batch capacity.
    #[error("batch element {batch}: seed index {seed} exceeds capacity max_entries = {max_entries}")]
    SeedBeyondCapacity {
        batch: usize,
        seed: usize,
        max_entries: usize,
    },

    /// A seed index points outside the valid entries of its batch element.
    #[error("batch element {batch}: seed index {seed} is not a valid entry (valid count {valid_count})")]
    SeedOutOfRange {
        batch: usize,
        seed: usize,
        valid_count: usize,
    },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
