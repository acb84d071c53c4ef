//! Error types for the key distributor.

use thiserror::Error;

use crate::config::ConfigError;
use crate::distributed::DistributedError;

/// Collective phase of the key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    /// Step-entry agreement on batch size and local status.
    Preflight,
    /// Phase A: per-destination key counts.
    Counts,
    /// Phase B: the counted keys.
    Payload,
    /// Step-exit agreement on success.
    Commit,
}

impl std::fmt::Display for ExchangePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangePhase::Preflight => write!(f, "preflight"),
            ExchangePhase::Counts => write!(f, "counts"),
            ExchangePhase::Payload => write!(f, "payload"),
            ExchangePhase::Commit => write!(f, "commit"),
        }
    }
}

/// Errors surfaced by a distribution step. None of them is retryable: a step
/// either completes on every device or fails on every device.
#[derive(Error, Debug)]
pub enum DistributorError {
    /// A key count outgrew a buffer sized from the placement config.
    #[error("capacity exceeded for {what}: required {required}, capacity {capacity}")]
    CapacityExceeded {
        what: &'static str,
        required: usize,
        capacity: usize,
    },

    /// Peers disagree on what was exchanged.
    #[error("protocol violation in {phase} phase: {detail}")]
    ProtocolViolation { phase: ExchangePhase, detail: String },

    /// Input shape is inconsistent with itself or with the peers.
    #[error("shape inconsistency: {0}")]
    ShapeMismatch(String),

    /// The injected placement rule returned a shard outside the table.
    #[error("placement returned shard {shard} for key {key} of table {table_id} with {num_shards} shards")]
    InvalidShard {
        table_id: usize,
        key: i64,
        shard: usize,
        num_shards: usize,
    },

    #[error("device {gpu_id} is not managed by this distributor (num_devices = {num_devices})")]
    UnknownDevice { gpu_id: usize, num_devices: usize },

    /// Another device (or this one) failed; the whole step is void.
    #[error("step aborted: devices {failed:?} reported failure")]
    StepAborted { failed: Vec<usize> },

    #[error("invalid placement: {0}")]
    Config(#[from] ConfigError),

    #[error("collective failed: {0}")]
    Distributed(#[from] DistributedError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl DistributorError {
    pub(crate) fn protocol(phase: ExchangePhase, detail: impl Into<String>) -> Self {
        DistributorError::ProtocolViolation {
            phase,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DistributorError>;
