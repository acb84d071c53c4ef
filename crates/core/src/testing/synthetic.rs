use candle_core::{Device, Tensor};
use rand::Rng;

use crate::config::PlacementConfig;

/// One device's samples, as a key list and bucket range per lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBatch {
    pub keys: Vec<Vec<i64>>,
    pub bucket_ranges: Vec<Vec<u32>>,
}

impl DeviceBatch {
    /// Build from `samples[lookup][sample]` key lists.
    pub fn from_samples(samples: &[Vec<Vec<i64>>]) -> Self {
        let mut keys = Vec::with_capacity(samples.len());
        let mut bucket_ranges = Vec::with_capacity(samples.len());
        for lookup in samples {
            let mut flat = Vec::new();
            let mut range = vec![0u32];
            for sample in lookup {
                flat.extend_from_slice(sample);
                range.push(flat.len() as u32);
            }
            keys.push(flat);
            bucket_ranges.push(range);
        }
        Self {
            keys,
            bucket_ranges,
        }
    }

    /// Random batch of `num_samples` samples. Each sample draws between 0
    /// and `max_hotness` keys per lookup from `0..key_space`.
    pub fn random<R: Rng>(
        config: &PlacementConfig,
        num_samples: usize,
        key_space: i64,
        rng: &mut R,
    ) -> Self {
        let samples: Vec<Vec<Vec<i64>>> = config
            .lookups
            .iter()
            .map(|lookup| {
                (0..num_samples)
                    .map(|_| {
                        let hotness = rng.gen_range(0..=lookup.max_hotness);
                        (0..hotness).map(|_| rng.gen_range(0..key_space)).collect()
                    })
                    .collect()
            })
            .collect();
        Self::from_samples(&samples)
    }

    pub fn num_lookups(&self) -> usize {
        self.keys.len()
    }

    pub fn num_samples(&self) -> usize {
        self.bucket_ranges
            .first()
            .map_or(0, |range| range.len() - 1)
    }

    pub fn num_keys(&self) -> usize {
        self.keys.iter().map(Vec::len).sum()
    }

    /// Keys of one sample of one lookup.
    pub fn sample_keys(&self, lookup: usize, sample: usize) -> &[i64] {
        let range = &self.bucket_ranges[lookup];
        &self.keys[lookup][range[sample] as usize..range[sample + 1] as usize]
    }

    /// Per-lookup key and bucket range tensors, the data-parallel input.
    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<(Vec<Tensor>, Vec<Tensor>)> {
        let keys = self
            .keys
            .iter()
            .map(|keys| Tensor::new(keys.as_slice(), device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let ranges = self
            .bucket_ranges
            .iter()
            .map(|range| Tensor::new(range.as_slice(), device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok((keys, ranges))
    }
}

/// Concatenate per-device batches, in device order, into the batch-major
/// full-batch layout: bucket `sample * num_lookups + lookup`.
pub fn full_batch(batches: &[DeviceBatch]) -> (Vec<i64>, Vec<u32>) {
    let mut keys = Vec::new();
    let mut range = vec![0u32];
    for batch in batches {
        for sample in 0..batch.num_samples() {
            for lookup in 0..batch.num_lookups() {
                keys.extend_from_slice(batch.sample_keys(lookup, sample));
                range.push(keys.len() as u32);
            }
        }
    }
    (keys, range)
}

/// [`full_batch`] as tensors.
pub fn full_batch_tensors(
    batches: &[DeviceBatch],
    device: &Device,
) -> candle_core::Result<(Tensor, Tensor)> {
    let (keys, range) = full_batch(batches);
    Ok((
        Tensor::new(keys.as_slice(), device)?,
        Tensor::new(range.as_slice(), device)?,
    ))
}
