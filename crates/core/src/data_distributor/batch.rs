//! Host staging of a device's share of the batch.
//!
//! Both input layouts end up here as one key list and one bucket range per
//! lookup, covering only the samples this device holds:
//!
//! - data-parallel input is already split by sample and only needs reading;
//! - full-batch input is batch-major (`bucket = sample * num_lookups + lookup`)
//!   and is transposed to feature-major while the device's sample window is
//!   sliced out.
//!
//! The per-lookup vectors are reused across steps.

use candle_core::{DType, Tensor};

use super::error::{DistributorError, Result};
use super::shape_cache::validate_bucket_range;
use crate::config::PlacementConfig;

fn read_keys(tensor: &Tensor) -> Result<Vec<i64>> {
    Ok(tensor.flatten_all()?.to_dtype(DType::I64)?.to_vec1::<i64>()?)
}

fn read_offsets(tensor: &Tensor) -> Result<Vec<u32>> {
    Ok(tensor.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?)
}

/// Per-lookup keys and bucket ranges of the samples held by one device.
#[derive(Debug, Default)]
pub struct LocalBatch {
    keys: Vec<Vec<i64>>,
    bucket_ranges: Vec<Vec<u32>>,
    num_samples: usize,
}

impl LocalBatch {
    pub fn new(num_lookups: usize) -> Self {
        Self {
            keys: vec![Vec::new(); num_lookups],
            bucket_ranges: vec![Vec::new(); num_lookups],
            num_samples: 0,
        }
    }

    pub fn num_lookups(&self) -> usize {
        self.keys.len()
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn keys(&self, lookup_id: usize) -> &[i64] {
        &self.keys[lookup_id]
    }

    pub fn bucket_range(&self, lookup_id: usize) -> &[u32] {
        &self.bucket_ranges[lookup_id]
    }

    /// Read data-parallel input: one key tensor and one bucket range tensor
    /// per lookup, each covering `num_samples` samples.
    pub fn load_data_parallel(
        &mut self,
        dp_keys: &[Tensor],
        dp_bucket_range: &[Tensor],
        num_samples: usize,
    ) -> Result<()> {
        let num_lookups = self.num_lookups();
        if dp_keys.len() != num_lookups || dp_bucket_range.len() != num_lookups {
            return Err(DistributorError::ShapeMismatch(format!(
                "expected {num_lookups} key and bucket range tensors, got {} and {}",
                dp_keys.len(),
                dp_bucket_range.len()
            )));
        }
        for (lookup_id, (keys, range)) in dp_keys.iter().zip(dp_bucket_range).enumerate() {
            self.keys[lookup_id].clear();
            self.keys[lookup_id].extend_from_slice(&read_keys(keys)?);
            self.bucket_ranges[lookup_id].clear();
            self.bucket_ranges[lookup_id].extend_from_slice(&read_offsets(range)?);
        }
        self.num_samples = num_samples;
        Ok(())
    }

    /// Read batch-major full-batch input and keep samples
    /// `device_id * b .. (device_id + 1) * b`, where `b = batch_size / num_devices`.
    pub fn load_full_batch(
        &mut self,
        keys: &Tensor,
        bucket_range: &Tensor,
        batch_size: usize,
        device_id: usize,
        num_devices: usize,
    ) -> Result<()> {
        let keys = read_keys(keys)?;
        let range = read_offsets(bucket_range)?;
        let num_lookups = self.num_lookups();

        let num_buckets = batch_size * num_lookups;
        if range.len() != num_buckets + 1 {
            return Err(DistributorError::ShapeMismatch(format!(
                "full-batch bucket range has {} boundaries, expected {}",
                range.len(),
                num_buckets + 1
            )));
        }
        if range[0] != 0
            || range.windows(2).any(|pair| pair[1] < pair[0])
            || range[num_buckets] as usize != keys.len()
        {
            return Err(DistributorError::ShapeMismatch(
                "full-batch bucket range is not a prefix sum over the keys".to_string(),
            ));
        }

        let b = batch_size / num_devices;
        let samples = device_id * b..(device_id + 1) * b;
        for lookup_id in 0..num_lookups {
            let lookup_keys = &mut self.keys[lookup_id];
            let lookup_range = &mut self.bucket_ranges[lookup_id];
            lookup_keys.clear();
            lookup_range.clear();
            lookup_range.push(0);
            for sample in samples.clone() {
                let bucket = sample * num_lookups + lookup_id;
                let (start, end) = (range[bucket] as usize, range[bucket + 1] as usize);
                lookup_keys.extend_from_slice(&keys[start..end]);
                lookup_range.push(lookup_keys.len() as u32);
            }
        }
        self.num_samples = b;
        Ok(())
    }

    /// Check every lookup's bucket range against its keys and hotness.
    pub fn validate(&self, config: &PlacementConfig) -> Result<()> {
        for (lookup_id, lookup) in config.lookups.iter().enumerate() {
            validate_bucket_range(
                &self.bucket_ranges[lookup_id],
                self.num_samples,
                self.keys[lookup_id].len(),
                lookup.max_hotness,
            )?;
        }
        Ok(())
    }
}
