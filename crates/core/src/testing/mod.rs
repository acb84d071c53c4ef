//! Shared test utilities for embdist-core.
//!
//! This module provides tiny placement configurations, in-process device
//! groups and synthetic batches for integration testing.

mod spmd;
mod synthetic;
mod tiny_config;

pub use spmd::{local_contexts, local_distributor, run_spmd, TEST_RECV_TIMEOUT};
pub use synthetic::{full_batch, full_batch_tensors, DeviceBatch};
pub use tiny_config::{tiny_dp_config, tiny_mixed_config, tiny_mp_config};
