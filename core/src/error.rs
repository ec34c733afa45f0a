/// Error types for the MHSA engines.
///
/// Every check runs once at the entry of an engine call, before any buffer is
/// touched. Past validation the compute chain is unconditional.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, MhsaError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MhsaError {
    #[error("dimension `{0}` must be greater than zero")]
    ZeroDimension(&'static str),

    #[error("hidden_dim {hidden_dim} is not divisible by num_heads {num_heads}")]
    HeadsDoNotDivide { hidden_dim: usize, num_heads: usize },

    #[error("tensor `{tensor}` has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("tensor `{tensor}` has {actual} elements, expected {rows}x{cols}")]
    BadLength {
        tensor: &'static str,
        rows: usize,
        cols: usize,
        actual: usize,
    },

    #[error("tensor `{tensor}` carries no gradient buffer")]
    MissingGradient { tensor: &'static str },

    #[error("scratch buffer `{buffer}` holds {actual} elements, needs {required}")]
    ScratchTooSmall {
        buffer: &'static str,
        required: usize,
        actual: usize,
    },

    #[error("tile_rows {tile_rows} must be non-zero and divide hidden_dim {hidden_dim}")]
    BadTiling { tile_rows: usize, hidden_dim: usize },

    #[error("fast-memory working set needs {required} bytes, budget is {budget}")]
    FastMemoryExceeded { required: usize, budget: usize },

    #[error("worker count must be at least 1")]
    ZeroWorkers,

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),

    #[error("head view over {len} elements cannot hold {heads} heads of {stride}")]
    BadHeadView { len: usize, heads: usize, stride: usize },

    #[error("transfer worker terminated before completing its copy")]
    TransferFailed,
}
