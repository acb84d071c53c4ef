//! Collective communication for the per-step key exchange.
//!
//! This module provides the abstractions the distributor talks to:
//! - [`ProcessGroup`] - Rank identity within the device group
//! - [`DeviceCommunicator`] - Collective operations (all_gather, all_to_all_v, ...)
//! - [`LocalCommunicator`] - One-thread-per-device implementation over channels
//!
//! # Usage
//!
//! ```ignore
//! use embdist_core::distributed::{LocalCommunicator, DeviceCommunicator};
//!
//! // Four devices, each driven by its own thread
//! let comms = LocalCommunicator::group(4, std::time::Duration::from_secs(10));
//! assert_eq!(comms[2].process_group().rank(), 2);
//! ```

mod communicator;
mod error;
mod process_group;

pub use communicator::{DeviceCommunicator, LocalCommunicator, DEFAULT_RECV_TIMEOUT};
pub use error::{DistributedError, Result};
pub use process_group::{GroupMember, ProcessGroup};
