use thiserror::Error;

/// Errors raised by the sweep harness itself.
///
/// Engine construction and model loading report through `anyhow`; this type
/// covers the batching and measurement protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BenchError {
    #[error("batch capacity exceeded: capacity {capacity}")]
    CapacityExceeded { capacity: usize },

    #[error("too many sequence ids for one request: given {given}, max {max}")]
    TooManySequences { given: usize, max: usize },

    #[error("decode failed on chunk {chunk_index} with status {status}")]
    DecodeFailed { chunk_index: usize, status: i32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, BenchError>;
