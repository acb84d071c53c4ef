//! Driver for the sparse key distributor: placement loading, logging setup
//! and a threaded SPMD simulation over synthetic batches.

pub mod config;
pub mod logging;
pub mod simulate;
pub mod synthetic;
