//! Step orchestration.
//!
//! [`DeviceDistributor`] runs one device's side of a step; every device of
//! the group runs its own instance concurrently (SPMD) and they meet only in
//! the communicator's collectives. [`DataDistributor`] owns one instance per
//! device and hands them out by device index.
//!
//! A step is all-or-nothing across the group:
//!
//! 1. **prepare** (local): validate input, look up the shape cache, filter
//!    data-parallel groups and label/sort model-parallel keys;
//! 2. **preflight** (collective): agree on batch size and on whether every
//!    device prepared successfully;
//! 3. **exchange** (collective): count then key exchange per model-parallel
//!    group, followed by index conversion;
//! 4. **commit** (collective): agree on whether every device finished.
//!
//! A device whose own work failed returns its error; its peers return
//! [`DistributorError::StepAborted`]. Outputs are cleared on any failure.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, warn};

use super::batch::LocalBatch;
use super::dp_filter::concat_keys_and_bucket_range;
use super::error::{DistributorError, ExchangePhase, Result};
use super::exchange::{exchange_counts, exchange_keys, is_local_fault};
use super::key_filter::KeyFilter;
use super::metrics::DistributorMetrics;
use super::mp_filter::FilterTempStorage;
use super::output::{allocate_output, EmbeddingInput};
use super::placement::Sharding;
use super::shape_cache::GpuShapeCache;
use crate::config::{ConfigError, PlacementConfig};
use crate::distributed::DeviceCommunicator;

/// Compute and communication handles of one device.
#[derive(Clone)]
pub struct DeviceContext {
    pub device_id: usize,
    pub device: Device,
    pub comm: Arc<dyn DeviceCommunicator>,
}

impl DeviceContext {
    pub fn new(device_id: usize, device: Device, comm: Arc<dyn DeviceCommunicator>) -> Self {
        Self {
            device_id,
            device,
            comm,
        }
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device_id", &self.device_id)
            .field("device", &self.device)
            .field("rank", &self.comm.process_group().rank())
            .field("world_size", &self.comm.process_group().world_size())
            .finish()
    }
}

/// Keys handled by one device in a committed step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStats {
    pub sent: usize,
    pub received: usize,
    pub dp_keys: usize,
}

#[derive(Debug)]
struct GroupPipeline {
    filter: KeyFilter,
    /// Model parallel: every lookup of the group. Data parallel: the local
    /// lookups.
    lookup_ids: Vec<usize>,
    scratch: Option<FilterTempStorage>,
}

impl GroupPipeline {
    fn build(config: &PlacementConfig, group_id: usize, device_id: usize, sharding: &Sharding) -> Self {
        let filter = KeyFilter::build(config, group_id, device_id, sharding);
        let (lookup_ids, scratch) = match &filter {
            KeyFilter::ModelParallel { selector, .. } => {
                let lookup_ids: Vec<usize> = selector.lookups().iter().map(|l| l.lookup_id).collect();
                let dest_lookups = (0..config.num_devices)
                    .map(|dest| {
                        selector
                            .lookups()
                            .iter()
                            .enumerate()
                            .filter(|(_, lookup)| lookup.shard_devices.contains(&dest))
                            .map(|(k, _)| k)
                            .collect()
                    })
                    .collect();
                let max_samples = config.batch_size_per_device(config.max_batch_size);
                let max_keys = max_samples
                    * lookup_ids
                        .iter()
                        .map(|&l| config.lookups[l].max_hotness)
                        .sum::<usize>();
                let scratch = FilterTempStorage::new(
                    config.num_devices,
                    lookup_ids.len(),
                    dest_lookups,
                    device_id,
                    max_samples,
                    max_keys,
                );
                (lookup_ids, Some(scratch))
            }
            KeyFilter::DataParallel { selector, .. } => (selector.lookup_ids.clone(), None),
        };
        Self {
            filter,
            lookup_ids,
            scratch,
        }
    }
}

/// One device's side of the distribution pipeline.
#[derive(Debug)]
pub struct DeviceDistributor {
    config: Arc<PlacementConfig>,
    ctx: DeviceContext,
    groups: Vec<GroupPipeline>,
    batch: LocalBatch,
    shape_cache: GpuShapeCache,
    metrics: Arc<DistributorMetrics>,
}

impl DeviceDistributor {
    /// Build the pipeline of `ctx.device_id`. Scratch storage is sized for
    /// the placement's largest batch here and never grows afterwards.
    pub fn new(config: Arc<PlacementConfig>, ctx: DeviceContext, sharding: &Sharding) -> Result<Self> {
        config.validate()?;
        let rank = ctx.comm.process_group().rank();
        let world_size = ctx.comm.process_group().world_size();
        if ctx.device_id >= config.num_devices {
            return Err(DistributorError::UnknownDevice {
                gpu_id: ctx.device_id,
                num_devices: config.num_devices,
            });
        }
        if rank != ctx.device_id || world_size != config.num_devices {
            return Err(ConfigError::ContextRank {
                index: ctx.device_id,
                rank,
                world_size,
            }
            .into());
        }

        let groups: Vec<GroupPipeline> = (0..config.groups.len())
            .map(|group_id| GroupPipeline::build(&config, group_id, ctx.device_id, sharding))
            .collect();
        let local_lookups = groups
            .iter()
            .map(|group| {
                group
                    .filter
                    .local_shards()
                    .iter()
                    .map(|shard| shard.lookup_id)
                    .collect()
            })
            .collect();

        Ok(Self {
            batch: LocalBatch::new(config.num_lookups()),
            shape_cache: GpuShapeCache::new(ctx.device_id, local_lookups),
            metrics: Arc::new(DistributorMetrics::new()),
            groups,
            config,
            ctx,
        })
    }

    pub fn device_id(&self) -> usize {
        self.ctx.device_id
    }

    pub fn device(&self) -> &Device {
        &self.ctx.device
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    pub fn shape_cache(&self) -> &GpuShapeCache {
        &self.shape_cache
    }

    /// Drop the cached bucket structure; the next step recomputes it.
    pub fn invalidate_shape_cache(&mut self) {
        self.shape_cache.invalidate();
    }

    pub fn metrics(&self) -> &Arc<DistributorMetrics> {
        &self.metrics
    }

    pub fn key_filter(&self, group_id: usize) -> &KeyFilter {
        &self.groups[group_id].filter
    }

    /// Scratch of a model-parallel group, holding the last step's counts.
    pub fn filter_storage(&self, group_id: usize) -> Option<&FilterTempStorage> {
        self.groups[group_id].scratch.as_ref()
    }

    /// Worst-case output buffers of this device.
    pub fn allocate_output(&self) -> Result<Vec<EmbeddingInput>> {
        allocate_output(&self.config, self.ctx.device_id)
    }

    /// Global bucket offsets of each group's local lookups for `batch_size`.
    ///
    /// Served from the shape cache, and counted as a cache lookup.
    pub fn init_fixed_bucket_ranges(&mut self, batch_size: usize) -> Result<Vec<Vec<u32>>> {
        self.check_batch_size(batch_size)?;
        let (entry, _) = self.shape_cache.get_or_compute(&self.config, batch_size);
        Ok(entry.group_bucket_offsets.clone())
    }

    /// Distribute data-parallel input: per lookup, the keys and bucket range
    /// of this device's `batch_size / num_devices` samples.
    pub fn distribute(
        &mut self,
        dp_keys: &[Tensor],
        dp_bucket_range: &[Tensor],
        output: &mut [EmbeddingInput],
        batch_size: usize,
    ) -> Result<()> {
        let staged = self
            .check_batch_size(batch_size)
            .and_then(|b| self.batch.load_data_parallel(dp_keys, dp_bucket_range, b));
        self.step(staged, output, batch_size)
    }

    /// Distribute full-batch input: all `batch_size` samples in batch-major
    /// layout, `batch_size * num_lookups + 1` boundaries. This device keeps
    /// its own sample window.
    pub fn distribute_fullbatch(
        &mut self,
        keys: &Tensor,
        bucket_range: &Tensor,
        output: &mut [EmbeddingInput],
        batch_size: usize,
    ) -> Result<()> {
        let device_id = self.ctx.device_id;
        let num_devices = self.config.num_devices;
        let staged = self.check_batch_size(batch_size).and_then(|_| {
            self.batch
                .load_full_batch(keys, bucket_range, batch_size, device_id, num_devices)
        });
        self.step(staged, output, batch_size)
    }

    fn check_batch_size(&self, batch_size: usize) -> Result<usize> {
        let num_devices = self.config.num_devices;
        if batch_size == 0 || batch_size % num_devices != 0 {
            return Err(DistributorError::ShapeMismatch(format!(
                "batch size {batch_size} must be a positive multiple of {num_devices} devices"
            )));
        }
        if batch_size > self.config.max_batch_size {
            return Err(DistributorError::CapacityExceeded {
                what: "batch size",
                required: batch_size,
                capacity: self.config.max_batch_size,
            });
        }
        Ok(batch_size / num_devices)
    }

    fn step(
        &mut self,
        staged: Result<()>,
        output: &mut [EmbeddingInput],
        batch_size: usize,
    ) -> Result<()> {
        let prepared = staged.and_then(|()| self.prepare(output, batch_size));
        match self.exchange(prepared, output, batch_size) {
            Ok(stats) => {
                self.metrics
                    .record_step(stats.sent, stats.received, stats.dp_keys);
                debug!(
                    device = self.ctx.device_id,
                    batch_size,
                    sent = stats.sent,
                    received = stats.received,
                    dp_keys = stats.dp_keys,
                    "step committed"
                );
                Ok(())
            }
            Err(err) => {
                self.metrics.record_abort();
                output.iter_mut().for_each(EmbeddingInput::clear);
                warn!(device = self.ctx.device_id, batch_size, error = %err, "step failed");
                Err(err)
            }
        }
    }

    /// Local half of a step. Returns the number of data-parallel keys.
    fn prepare(&mut self, output: &mut [EmbeddingInput], batch_size: usize) -> Result<usize> {
        if output.len() != self.groups.len() {
            return Err(DistributorError::ShapeMismatch(format!(
                "expected {} outputs, one per group, got {}",
                self.groups.len(),
                output.len()
            )));
        }
        for (group_id, (group, out)) in self.groups.iter().zip(output.iter()).enumerate() {
            let local = group.filter.local_shards();
            let matches = out.group_id() == group_id
                && out.mode() == group.filter.mode()
                && out.lookup_ids().len() == local.len()
                && out
                    .lookup_ids()
                    .iter()
                    .zip(local)
                    .all(|(&id, shard)| id == shard.lookup_id);
            if !matches {
                return Err(DistributorError::ShapeMismatch(format!(
                    "output {group_id} was not allocated for group {group_id} on device {}",
                    self.ctx.device_id
                )));
            }
        }

        self.batch.validate(&self.config)?;

        let (entry, hit) = self.shape_cache.get_or_compute(&self.config, batch_size);
        self.metrics.record_cache(hit);
        debug!(device = self.ctx.device_id, batch_size, hit, "shape cache lookup");
        entry.check_windows(&self.batch)?;

        let b = entry.batch_size_per_device;
        let mut dp_keys = 0;
        for (group_id, (group, out)) in self.groups.iter_mut().zip(output.iter_mut()).enumerate() {
            let offsets = &entry.group_bucket_offsets[group_id];
            match (&group.filter, group.scratch.as_mut()) {
                (KeyFilter::ModelParallel { selector, .. }, Some(scratch)) => {
                    out.begin(batch_size, offsets)?;
                    scratch.label_and_count(selector, &self.batch, &group.lookup_ids)?;
                    scratch.scan_and_sort();
                    scratch.swizzle_counts();
                }
                (KeyFilter::DataParallel { selector, index_calc }, _) => {
                    out.begin(b, offsets)?;
                    dp_keys += concat_keys_and_bucket_range(selector, &self.batch, out)?;
                    let (keys, lookup_offsets) = out.keys_and_offsets_mut();
                    index_calc.convert_all(keys, lookup_offsets);
                }
                (KeyFilter::ModelParallel { .. }, None) => {
                    return Err(DistributorError::ShapeMismatch(format!(
                        "model-parallel group {group_id} has no scratch storage"
                    )))
                }
            }
        }
        Ok(dp_keys)
    }

    /// All-gather `values` from every device; returns one vote per device,
    /// in rank order.
    fn agree(&self, phase: ExchangePhase, values: &[i64]) -> Result<Vec<Vec<i64>>> {
        let comm = &self.ctx.comm;
        let world_size = comm.process_group().world_size();
        let local = Tensor::new(values, &self.ctx.device)?;
        let gathered = comm.all_gather(&local, 0)?;
        if gathered.dtype() != DType::I64 || gathered.dim(0)? != values.len() * world_size {
            return Err(DistributorError::protocol(
                phase,
                format!("agreement returned shape {:?}", gathered.dims()),
            ));
        }
        let gathered = gathered.to_vec1::<i64>()?;
        Ok(gathered.chunks(values.len()).map(<[i64]>::to_vec).collect())
    }

    /// Collective half of a step.
    fn exchange(
        &mut self,
        prepared: Result<usize>,
        output: &mut [EmbeddingInput],
        batch_size: usize,
    ) -> Result<StepStats> {
        // preflight: every device joins, even after a local failure
        let votes = self.agree(
            ExchangePhase::Preflight,
            &[batch_size as i64, prepared.is_ok() as i64],
        )?;
        let sizes: Vec<i64> = votes.iter().map(|vote| vote[0]).collect();
        if sizes.iter().any(|&size| size != batch_size as i64) {
            return Err(DistributorError::ShapeMismatch(format!(
                "batch sizes differ across devices: {sizes:?}"
            )));
        }
        let dp_keys = prepared?;
        let failed: Vec<usize> = votes
            .iter()
            .enumerate()
            .filter(|(_, vote)| vote[1] == 0)
            .map(|(device, _)| device)
            .collect();
        if !failed.is_empty() {
            return Err(DistributorError::StepAborted { failed });
        }

        let mut stats = StepStats {
            dp_keys,
            ..StepStats::default()
        };
        let mut fault: Option<DistributorError> = None;
        let comm = self.ctx.comm.as_ref();
        let device = &self.ctx.device;
        for (group_id, group) in self.groups.iter_mut().enumerate() {
            let Some(scratch) = group.scratch.as_mut() else {
                continue;
            };
            let out = &mut output[group_id];

            let counts_ok = match exchange_counts(comm, scratch, device) {
                Ok(()) => true,
                Err(err) if is_local_fault(&err) => {
                    fault.get_or_insert(err);
                    false
                }
                Err(err) => return Err(err),
            };
            let reconstruct = counts_ok && fault.is_none();
            match exchange_keys(comm, scratch, out, device, !reconstruct) {
                Ok(moved) => {
                    stats.sent += moved.sent;
                    stats.received += moved.received;
                    if reconstruct {
                        let (keys, lookup_offsets) = out.keys_and_offsets_mut();
                        group.filter.index_calc().convert_all(keys, lookup_offsets);
                    }
                }
                Err(err) if is_local_fault(&err) => {
                    fault.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
            debug!(
                device = self.ctx.device_id,
                group = group_id,
                sent = ?scratch.send_k_per_g(),
                received = ?scratch.recv_k_per_g(),
                "group exchanged"
            );
        }

        // commit
        let votes = self.agree(ExchangePhase::Commit, &[fault.is_none() as i64])?;
        if let Some(err) = fault {
            return Err(err);
        }
        let failed: Vec<usize> = votes
            .iter()
            .enumerate()
            .filter(|(_, vote)| vote[0] == 0)
            .map(|(device, _)| device)
            .collect();
        if !failed.is_empty() {
            return Err(DistributorError::StepAborted { failed });
        }
        Ok(stats)
    }
}

/// Registry of per-device distributors, indexed by device id.
///
/// Devices must step concurrently, since every step synchronizes the whole
/// group. Drive them from one thread each, either by borrowing
/// [`workers_mut`](Self::workers_mut) inside [`std::thread::scope`] or by
/// moving them out with [`into_workers`](Self::into_workers).
#[derive(Debug)]
pub struct DataDistributor {
    config: Arc<PlacementConfig>,
    workers: Vec<DeviceDistributor>,
}

impl DataDistributor {
    /// Build one pipeline per device context. Context `i` must be device `i`
    /// and rank `i` of a group of `num_devices`.
    pub fn new(contexts: Vec<DeviceContext>, config: PlacementConfig, sharding: Sharding) -> Result<Self> {
        config.validate()?;
        if contexts.len() != config.num_devices {
            return Err(ConfigError::ContextCount {
                expected: config.num_devices,
                actual: contexts.len(),
            }
            .into());
        }
        for (index, ctx) in contexts.iter().enumerate() {
            let pg = ctx.comm.process_group();
            if ctx.device_id != index || pg.rank() != index || pg.world_size() != config.num_devices {
                return Err(ConfigError::ContextRank {
                    index,
                    rank: pg.rank(),
                    world_size: pg.world_size(),
                }
                .into());
            }
        }

        let config = Arc::new(config);
        let workers = contexts
            .into_iter()
            .map(|ctx| DeviceDistributor::new(config.clone(), ctx, &sharding))
            .collect::<Result<Vec<_>>>()?;

        info!(
            num_devices = config.num_devices,
            num_lookups = config.num_lookups(),
            num_groups = config.groups.len(),
            max_batch_size = config.max_batch_size,
            "Data distributor initialized"
        );
        Ok(Self { config, workers })
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    pub fn num_devices(&self) -> usize {
        self.workers.len()
    }

    pub fn worker(&self, gpu_id: usize) -> Result<&DeviceDistributor> {
        let num_devices = self.workers.len();
        self.workers
            .get(gpu_id)
            .ok_or(DistributorError::UnknownDevice {
                gpu_id,
                num_devices,
            })
    }

    pub fn worker_mut(&mut self, gpu_id: usize) -> Result<&mut DeviceDistributor> {
        let num_devices = self.workers.len();
        self.workers
            .get_mut(gpu_id)
            .ok_or(DistributorError::UnknownDevice {
                gpu_id,
                num_devices,
            })
    }

    pub fn workers_mut(&mut self) -> &mut [DeviceDistributor] {
        &mut self.workers
    }

    pub fn into_workers(self) -> Vec<DeviceDistributor> {
        self.workers
    }

    /// Output buffers for device `gpu_id`.
    pub fn allocate_output(&self, gpu_id: usize) -> Result<Vec<EmbeddingInput>> {
        self.worker(gpu_id)?.allocate_output()
    }

    /// Run device `gpu_id`'s side of a step with data-parallel input.
    ///
    /// Blocks until every other device joins the step.
    pub fn distribute(
        &mut self,
        gpu_id: usize,
        dp_keys: &[Tensor],
        dp_bucket_range: &[Tensor],
        output: &mut [EmbeddingInput],
        batch_size: usize,
    ) -> Result<()> {
        self.worker_mut(gpu_id)?
            .distribute(dp_keys, dp_bucket_range, output, batch_size)
    }

    /// Run device `gpu_id`'s side of a step with full-batch input.
    ///
    /// Blocks until every other device joins the step.
    pub fn distribute_fullbatch(
        &mut self,
        gpu_id: usize,
        keys: &Tensor,
        bucket_range: &Tensor,
        output: &mut [EmbeddingInput],
        batch_size: usize,
    ) -> Result<()> {
        self.worker_mut(gpu_id)?
            .distribute_fullbatch(keys, bucket_range, output, batch_size)
    }
}
