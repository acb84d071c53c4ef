//! Error types for distributed operations.

use thiserror::Error;

/// Errors that can occur during collective operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Split vector length does not match the group size.
    #[error("expected {expected} splits (one per rank), got {actual}")]
    SplitCount { expected: usize, actual: usize },

    /// Tensor shape mismatch for collective operation.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A peer delivered a chunk whose length differs from the agreed split.
    #[error("rank {src} sent {actual} elements, expected {expected}")]
    ChunkSizeMismatch {
        src: usize,
        expected: usize,
        actual: usize,
    },

    /// Ranks entered different collective calls.
    #[error("collective sequence mismatch from rank {src}: expected #{expected}, got #{actual}")]
    SequenceMismatch { src: usize, expected: u64, actual: u64 },

    /// A peer dropped its endpoint before the collective completed.
    #[error("rank {rank} left the group before the collective completed")]
    PeerDisconnected { rank: usize },

    /// Communication timeout.
    #[error("communication timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
