//! Per-step redistribution of sparse keys to the devices that own them.
//!
//! Training batches arrive split by sample across devices, while embedding
//! tables are split by shard. Before any lookup can run, each device must
//! hold exactly the keys of the shards it owns, grouped so gradients can
//! later be scattered back to the original samples.
//!
//! The pipeline per step and device:
//!
//! ```text
//! keys + bucket ranges ──► LocalBatch ──► shape cache
//!                                           │
//!        ┌──────────────────────────────────┴──────────────┐
//!        ▼ model parallel                                  ▼ data parallel
//!   label / count / sort                         concat keys + ranges
//!        │                                                 │
//!   count exchange ──► key exchange ──► reconstruct        │
//!        │                                                 │
//!        └──────────────► index conversion ◄───────────────┘
//!                                │
//!                                ▼
//!                        EmbeddingInput per group
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use candle_core::Device;
//! use embdist_core::config::PlacementConfig;
//! use embdist_core::data_distributor::{DataDistributor, DeviceContext, Sharding};
//! use embdist_core::distributed::{LocalCommunicator, DEFAULT_RECV_TIMEOUT};
//!
//! let config = PlacementConfig::from_json_file("placement.json")?;
//! let contexts = LocalCommunicator::group(config.num_devices, DEFAULT_RECV_TIMEOUT)
//!     .into_iter()
//!     .enumerate()
//!     .map(|(id, comm)| DeviceContext::new(id, Device::Cpu, Arc::new(comm)))
//!     .collect();
//! let mut distributor = DataDistributor::new(contexts, config, Sharding::default())?;
//!
//! std::thread::scope(|s| {
//!     for worker in distributor.workers_mut() {
//!         s.spawn(move || {
//!             let mut output = worker.allocate_output()?;
//!             worker.distribute(&keys, &ranges, &mut output, batch_size)
//!         });
//!     }
//! });
//! ```

mod batch;
mod distributor;
mod dp_filter;
mod error;
mod exchange;
mod indices;
mod key_filter;
mod metrics;
mod mp_filter;
mod output;
mod placement;
mod shape_cache;

pub use batch::LocalBatch;
pub use distributor::{DataDistributor, DeviceContext, DeviceDistributor, StepStats};
pub use dp_filter::concat_keys_and_bucket_range;
pub use error::{DistributorError, ExchangePhase, Result};
pub use exchange::{exchange_counts, exchange_keys, reconstruct, ExchangeStats};
pub use indices::{IndexCalculation, LocalShard};
pub use key_filter::{DpKeySelector, KeyFilter, LookupShards, MpKeySelector};
pub use metrics::{DistributorMetrics, MetricsSnapshot};
pub use mp_filter::FilterTempStorage;
pub use output::{allocate_output, EmbeddingInput};
pub use placement::{ExplicitPlacement, IdentityIndex, KeyToIndex, ModuloPlacement, ShardPlacement, Sharding};
pub use shape_cache::{bucket_range_from_lengths, validate_bucket_range, GpuShapeCache, ShapeEntry};
