//! Bucket-range computation and the per-device batch-shape cache.
//!
//! For a fixed placement, everything about a step's bucket structure that
//! does not depend on the key values is a function of the batch size alone:
//! where each lookup's keys may start in the worst case, and where each
//! local lookup lands in the global bucket space. The cache keeps that
//! structure for the last batch size seen and recomputes it only when the
//! batch size changes.

use candle_core::{Device, Tensor};

use super::batch::LocalBatch;
use super::error::{DistributorError, Result};
use crate::config::{PlacementConfig, PlacementMode};

/// Prefix-sum boundaries of per-sample key list lengths.
///
/// `lengths.len() + 1` boundaries are returned, starting at 0.
pub fn bucket_range_from_lengths(lengths: &[u32]) -> Vec<u32> {
    let mut range = Vec::with_capacity(lengths.len() + 1);
    let mut acc = 0u32;
    range.push(acc);
    for &len in lengths {
        acc += len;
        range.push(acc);
    }
    range
}

/// Check one lookup's bucket range against its keys and hotness bound.
///
/// The range must have `num_samples + 1` entries, start at 0, never
/// decrease and end at `num_keys`. A sample with more than `max_hotness`
/// keys would overflow the preallocated buffers.
pub fn validate_bucket_range(
    range: &[u32],
    num_samples: usize,
    num_keys: usize,
    max_hotness: usize,
) -> Result<()> {
    if range.len() != num_samples + 1 {
        return Err(DistributorError::ShapeMismatch(format!(
            "bucket range has {} boundaries, expected {}",
            range.len(),
            num_samples + 1
        )));
    }
    if range[0] != 0 {
        return Err(DistributorError::ShapeMismatch(format!(
            "bucket range starts at {}",
            range[0]
        )));
    }
    for (s, pair) in range.windows(2).enumerate() {
        if pair[1] < pair[0] {
            return Err(DistributorError::ShapeMismatch(format!(
                "bucket range decreases at sample {s}: {} -> {}",
                pair[0], pair[1]
            )));
        }
        let len = (pair[1] - pair[0]) as usize;
        if len > max_hotness {
            return Err(DistributorError::CapacityExceeded {
                what: "keys per sample",
                required: len,
                capacity: max_hotness,
            });
        }
    }
    let last = range[num_samples] as usize;
    if last != num_keys {
        return Err(DistributorError::ShapeMismatch(format!(
            "bucket range ends at {last}, but the lookup has {num_keys} keys"
        )));
    }
    Ok(())
}

/// Batch-shape dependent bucket structure of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeEntry {
    /// Global batch size this entry was built for.
    pub batch_size: usize,
    /// Samples held by this device.
    pub batch_size_per_device: usize,
    /// Worst-case start of each lookup in the device's concatenated input:
    /// prefix sums of `max_hotness * batch_size_per_device`, one per lookup
    /// plus the end.
    pub hotness_bucket_range: Vec<u32>,
    /// Per group, the global bucket offset of each local lookup.
    pub group_bucket_offsets: Vec<Vec<u32>>,
}

impl ShapeEntry {
    /// Build the entry for `batch_size` on `device_id`.
    ///
    /// `local_lookups[g]` lists the lookups group `g` emits on this device.
    pub fn compute(
        config: &PlacementConfig,
        device_id: usize,
        local_lookups: &[Vec<usize>],
        batch_size: usize,
    ) -> Self {
        let b = config.batch_size_per_device(batch_size);

        let lengths: Vec<u32> = config
            .lookups
            .iter()
            .map(|lookup| (lookup.max_hotness * b) as u32)
            .collect();
        let hotness_bucket_range = bucket_range_from_lengths(&lengths);

        let group_bucket_offsets = config
            .groups
            .iter()
            .zip(local_lookups)
            .map(|(group, lookups)| {
                (0..lookups.len())
                    .map(|j| match group.mode {
                        PlacementMode::ModelParallel => (j * batch_size) as u32,
                        PlacementMode::DataParallel => (j * batch_size + device_id * b) as u32,
                    })
                    .collect()
            })
            .collect();

        Self {
            batch_size,
            batch_size_per_device: b,
            hotness_bucket_range,
            group_bucket_offsets,
        }
    }

    /// Check that each staged lookup fits its worst-case window.
    pub fn check_windows(&self, batch: &LocalBatch) -> Result<()> {
        if batch.num_samples() != self.batch_size_per_device {
            return Err(DistributorError::ShapeMismatch(format!(
                "staged {} samples, expected {}",
                batch.num_samples(),
                self.batch_size_per_device
            )));
        }
        for (lookup_id, window) in self.hotness_bucket_range.windows(2).enumerate() {
            let capacity = (window[1] - window[0]) as usize;
            let required = batch.keys(lookup_id).len();
            if required > capacity {
                return Err(DistributorError::CapacityExceeded {
                    what: "keys per lookup",
                    required,
                    capacity,
                });
            }
        }
        Ok(())
    }

    /// Hotness bucket range as a device tensor.
    pub fn hotness_bucket_range_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::new(self.hotness_bucket_range.as_slice(), device)?)
    }
}

/// One-slot cache keyed by batch size.
///
/// Owned by a single device's distributor; never shared between threads.
#[derive(Debug)]
pub struct GpuShapeCache {
    device_id: usize,
    local_lookups: Vec<Vec<usize>>,
    entry: Option<ShapeEntry>,
    hits: u64,
    misses: u64,
}

impl GpuShapeCache {
    pub fn new(device_id: usize, local_lookups: Vec<Vec<usize>>) -> Self {
        Self {
            device_id,
            local_lookups,
            entry: None,
            hits: 0,
            misses: 0,
        }
    }

    /// Batch size of the cached entry, if any.
    pub fn last_batch_size(&self) -> Option<usize> {
        self.entry.as_ref().map(|entry| entry.batch_size)
    }

    /// Cached entry, if any.
    pub fn entry(&self) -> Option<&ShapeEntry> {
        self.entry.as_ref()
    }

    /// Return the entry for `batch_size`, recomputing it on a batch size
    /// change. The flag is `true` on a cache hit.
    pub fn get_or_compute(
        &mut self,
        config: &PlacementConfig,
        batch_size: usize,
    ) -> (&ShapeEntry, bool) {
        let hit = self.last_batch_size() == Some(batch_size);
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
            self.entry = None;
        }
        let entry = self.entry.get_or_insert_with(|| {
            ShapeEntry::compute(config, self.device_id, &self.local_lookups, batch_size)
        });
        (entry, hit)
    }

    /// Compute the entry for `batch_size` without touching the cache.
    pub fn compute_uncached(&self, config: &PlacementConfig, batch_size: usize) -> ShapeEntry {
        ShapeEntry::compute(config, self.device_id, &self.local_lookups, batch_size)
    }

    /// Drop the cached entry; the next lookup recomputes.
    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PlacementConfig {
        PlacementConfig::from_json_str(
            r#"{
                "num_devices": 2,
                "max_batch_size": 8,
                "lookups": [
                    { "table_id": 0, "max_hotness": 3 },
                    { "table_id": 1, "max_hotness": 1 }
                ],
                "tables": [ { "shards": [0, 1] }, { "shards": [0, 1] } ],
                "groups": [
                    { "mode": "mp", "table_ids": [0] },
                    { "mode": "dp", "table_ids": [1] }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn lengths_to_bucket_range() {
        assert_eq!(bucket_range_from_lengths(&[2, 0, 1]), vec![0, 2, 2, 3]);
        assert_eq!(bucket_range_from_lengths(&[]), vec![0]);
    }

    #[test]
    fn validate_accepts_well_formed_range() {
        validate_bucket_range(&[0, 2, 2, 3], 3, 3, 2).unwrap();
    }

    #[test]
    fn validate_rejects_decreasing_range() {
        let err = validate_bucket_range(&[0, 2, 1, 3], 3, 3, 4).unwrap_err();
        assert!(matches!(err, DistributorError::ShapeMismatch(_)));
    }

    #[test]
    fn validate_rejects_wrong_total() {
        let err = validate_bucket_range(&[0, 1, 2], 2, 3, 4).unwrap_err();
        assert!(matches!(err, DistributorError::ShapeMismatch(_)));
    }

    #[test]
    fn validate_rejects_hot_sample() {
        let err = validate_bucket_range(&[0, 3], 1, 3, 2).unwrap_err();
        assert!(matches!(
            err,
            DistributorError::CapacityExceeded {
                required: 3,
                capacity: 2,
                ..
            }
        ));
    }

    #[test]
    fn entry_layout_per_mode() {
        let entry = ShapeEntry::compute(&config(), 1, &[vec![0], vec![1]], 8);
        assert_eq!(entry.batch_size_per_device, 4);
        assert_eq!(entry.hotness_bucket_range, vec![0, 12, 16]);
        // mp lookups start at j * B, dp lookups at j * B + d * b
        assert_eq!(entry.group_bucket_offsets, vec![vec![0], vec![4]]);
    }

    #[test]
    fn same_batch_size_hits() {
        let config = config();
        let mut cache = GpuShapeCache::new(0, vec![vec![0], vec![1]]);
        let (_, hit) = cache.get_or_compute(&config, 8);
        assert!(!hit);
        let (cached, hit) = cache.get_or_compute(&config, 8);
        let cached = cached.clone();
        assert!(hit);
        assert_eq!(cached, cache.compute_uncached(&config, 8));
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
    }

    #[test]
    fn batch_size_change_misses_once() {
        let config = config();
        let mut cache = GpuShapeCache::new(0, vec![vec![0], vec![1]]);
        cache.get_or_compute(&config, 8);
        cache.get_or_compute(&config, 4);
        cache.get_or_compute(&config, 4);
        assert_eq!(cache.last_batch_size(), Some(4));
        assert_eq!((cache.hits(), cache.misses()), (1, 2));
    }

    #[test]
    fn invalidate_forces_recompute() {
        let config = config();
        let mut cache = GpuShapeCache::new(0, vec![vec![0], vec![1]]);
        cache.get_or_compute(&config, 8);
        cache.invalidate();
        assert_eq!(cache.last_batch_size(), None);
        let (_, hit) = cache.get_or_compute(&config, 8);
        assert!(!hit);
    }

    #[test]
    fn windows_bound_staged_lookups() {
        let entry = ShapeEntry::compute(&config(), 0, &[vec![0], vec![1]], 8);
        let ranges = [
            Tensor::new(&[0u32, 3, 6, 9, 12], &Device::Cpu).unwrap(),
            Tensor::new(&[0u32, 1, 2, 3, 5], &Device::Cpu).unwrap(),
        ];
        let keys = [
            Tensor::new(&[7i64; 12], &Device::Cpu).unwrap(),
            Tensor::new(&[7i64; 5], &Device::Cpu).unwrap(),
        ];
        let mut batch = LocalBatch::new(2);
        batch.load_data_parallel(&keys, &ranges, 4).unwrap();
        let err = entry.check_windows(&batch).unwrap_err();
        assert!(matches!(
            err,
            DistributorError::CapacityExceeded {
                what: "keys per lookup",
                required: 5,
                capacity: 4,
            }
        ));

        let keys = [
            Tensor::new(&[7i64; 12], &Device::Cpu).unwrap(),
            Tensor::new(&[7i64; 4], &Device::Cpu).unwrap(),
        ];
        let ranges = [
            Tensor::new(&[0u32, 3, 6, 9, 12], &Device::Cpu).unwrap(),
            Tensor::new(&[0u32, 1, 2, 3, 4], &Device::Cpu).unwrap(),
        ];
        batch.load_data_parallel(&keys, &ranges, 4).unwrap();
        entry.check_windows(&batch).unwrap();

        batch.load_data_parallel(&keys, &ranges, 3).unwrap();
        let err = entry.check_windows(&batch).unwrap_err();
        assert!(matches!(err, DistributorError::ShapeMismatch(_)));
    }

    #[test]
    fn hotness_range_tensor_matches_vec() {
        let entry = ShapeEntry::compute(&config(), 0, &[vec![0], vec![1]], 8);
        let t = entry.hotness_bucket_range_tensor(&Device::Cpu).unwrap();
        assert_eq!(t.to_vec1::<u32>().unwrap(), entry.hotness_bucket_range);
    }
}
