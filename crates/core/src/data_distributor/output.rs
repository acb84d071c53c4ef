//! Per-group output buffers consumed by the lookup kernels.

use candle_core::{Device, Tensor};

use super::error::{DistributorError, Result};
use crate::config::{PlacementConfig, PlacementMode};

/// Keys of one group on one device, ready for lookup.
///
/// Buffers are sized once by [`allocate_output`] to the worst case of the
/// placement and refilled in place every step. Only the prefixes reported by
/// [`keys`](Self::keys) and [`bucket_range`](Self::bucket_range) hold data of
/// the current step.
///
/// Layout is feature-major: local lookup `j` owns buckets
/// `j * buckets_per_lookup .. (j + 1) * buckets_per_lookup`. For
/// model-parallel groups a lookup's buckets cover the global batch in
/// source-device order; for data-parallel groups they cover this device's
/// samples.
#[derive(Debug, Clone)]
pub struct EmbeddingInput {
    group_id: usize,
    mode: PlacementMode,
    lookup_ids: Vec<usize>,
    table_ids: Vec<usize>,
    keys: Vec<i64>,
    bucket_range: Vec<u32>,
    num_keys: usize,
    num_buckets: usize,
    lookup_offsets: Vec<u32>,
    global_bucket_offsets: Vec<u32>,
    buckets_per_lookup: usize,
}

impl EmbeddingInput {
    /// Empty output with room for `key_capacity` keys and
    /// `bucket_capacity` buckets per lookup.
    pub fn with_capacity(
        group_id: usize,
        mode: PlacementMode,
        lookup_ids: Vec<usize>,
        table_ids: Vec<usize>,
        key_capacity: usize,
        bucket_capacity: usize,
    ) -> Self {
        let num_lookups = lookup_ids.len();
        Self {
            group_id,
            mode,
            keys: vec![0; key_capacity],
            bucket_range: vec![0; num_lookups * bucket_capacity + 1],
            num_keys: 0,
            num_buckets: 0,
            lookup_offsets: vec![0; num_lookups + 1],
            global_bucket_offsets: vec![0; num_lookups],
            buckets_per_lookup: 0,
            lookup_ids,
            table_ids,
        }
    }

    pub fn group_id(&self) -> usize {
        self.group_id
    }

    pub fn mode(&self) -> PlacementMode {
        self.mode
    }

    /// Global ids of the local lookups, in output order.
    pub fn lookup_ids(&self) -> &[usize] {
        &self.lookup_ids
    }

    pub fn table_ids(&self) -> &[usize] {
        &self.table_ids
    }

    pub fn num_lookups(&self) -> usize {
        self.lookup_ids.len()
    }

    /// Converted keys of the current step.
    pub fn keys(&self) -> &[i64] {
        &self.keys[..self.num_keys]
    }

    /// Bucket boundaries of the current step, `num_buckets + 1` entries.
    pub fn bucket_range(&self) -> &[u32] {
        &self.bucket_range[..self.num_buckets + 1]
    }

    pub fn num_keys(&self) -> usize {
        self.num_keys
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    /// Start of each local lookup in [`keys`](Self::keys), plus the end.
    pub fn lookup_offsets(&self) -> &[u32] {
        &self.lookup_offsets
    }

    /// Position of each local lookup's first bucket in the global
    /// `lookup x batch` bucket space.
    pub fn global_bucket_offsets(&self) -> &[u32] {
        &self.global_bucket_offsets
    }

    pub fn buckets_per_lookup(&self) -> usize {
        self.buckets_per_lookup
    }

    pub fn key_capacity(&self) -> usize {
        self.keys.len()
    }

    pub fn bucket_capacity(&self) -> usize {
        self.bucket_range.len() - 1
    }

    /// Keys of the `j`-th local lookup.
    pub fn lookup_keys(&self, j: usize) -> &[i64] {
        let start = self.lookup_offsets[j] as usize;
        let end = self.lookup_offsets[j + 1] as usize;
        &self.keys[start..end]
    }

    /// Bucket boundaries of the `j`-th local lookup, `buckets_per_lookup + 1`
    /// entries, still relative to the start of [`keys`](Self::keys).
    pub fn lookup_bucket_range(&self, j: usize) -> &[u32] {
        let start = j * self.buckets_per_lookup;
        &self.bucket_range[start..start + self.buckets_per_lookup + 1]
    }

    pub fn keys_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::new(self.keys(), device)?)
    }

    pub fn bucket_range_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::new(self.bucket_range(), device)?)
    }

    /// Forget the current step's data. Capacity is kept.
    pub fn clear(&mut self) {
        self.num_keys = 0;
        self.num_buckets = 0;
        self.buckets_per_lookup = 0;
        self.bucket_range[0] = 0;
        self.lookup_offsets.fill(0);
    }

    /// Fail unless `required` keys fit.
    pub(crate) fn reserve_keys(&self, required: usize) -> Result<()> {
        if required > self.keys.len() {
            return Err(DistributorError::CapacityExceeded {
                what: "output keys",
                required,
                capacity: self.keys.len(),
            });
        }
        Ok(())
    }

    /// Start a step with `buckets_per_lookup` buckets per local lookup.
    pub(crate) fn begin(&mut self, buckets_per_lookup: usize, global_bucket_offsets: &[u32]) -> Result<()> {
        let num_buckets = self.num_lookups() * buckets_per_lookup;
        if num_buckets > self.bucket_capacity() {
            return Err(DistributorError::CapacityExceeded {
                what: "output buckets",
                required: num_buckets,
                capacity: self.bucket_capacity(),
            });
        }
        self.buckets_per_lookup = buckets_per_lookup;
        self.num_buckets = num_buckets;
        self.num_keys = 0;
        self.global_bucket_offsets
            .copy_from_slice(global_bucket_offsets);
        Ok(())
    }

    /// Mutable views of the step's key and bucket buffers.
    pub(crate) fn buffers_mut(&mut self) -> (&mut [i64], &mut [u32]) {
        let num_buckets = self.num_buckets;
        (
            self.keys.as_mut_slice(),
            &mut self.bucket_range[..num_buckets + 1],
        )
    }

    /// Seal the step once the bucket range is complete: record the key count
    /// and derive per-lookup key offsets.
    pub(crate) fn finish(&mut self) {
        self.num_keys = self.bucket_range[self.num_buckets] as usize;
        for j in 0..=self.num_lookups() {
            self.lookup_offsets[j] = self.bucket_range[j * self.buckets_per_lookup];
        }
    }

    /// Keys of the step and the lookup offsets, for in-place conversion.
    pub(crate) fn keys_and_offsets_mut(&mut self) -> (&mut [i64], &[u32]) {
        (&mut self.keys[..self.num_keys], &self.lookup_offsets)
    }
}

/// Allocate the outputs of device `gpu_id`, one per group, sized to the
/// worst case of the placement.
///
/// Model-parallel outputs hold `max_batch_size x sum(max_hotness)` keys over
/// the device's local lookups; data-parallel outputs hold the same for the
/// device's share of the batch.
pub fn allocate_output(config: &PlacementConfig, gpu_id: usize) -> Result<Vec<EmbeddingInput>> {
    config.validate()?;
    if gpu_id >= config.num_devices {
        return Err(DistributorError::UnknownDevice {
            gpu_id,
            num_devices: config.num_devices,
        });
    }

    let max_b = config.batch_size_per_device(config.max_batch_size);
    let output = config
        .groups
        .iter()
        .enumerate()
        .map(|(group_id, group)| {
            let lookup_ids = config.local_lookups(group_id, gpu_id);
            let table_ids = lookup_ids
                .iter()
                .map(|&lookup_id| config.lookups[lookup_id].table_id)
                .collect();
            let hotness: usize = lookup_ids
                .iter()
                .map(|&lookup_id| config.lookups[lookup_id].max_hotness)
                .sum();
            let samples = match group.mode {
                PlacementMode::ModelParallel => config.max_batch_size,
                PlacementMode::DataParallel => max_b,
            };
            EmbeddingInput::with_capacity(
                group_id,
                group.mode,
                lookup_ids,
                table_ids,
                samples * hotness,
                samples,
            )
        })
        .collect();
    Ok(output)
}
