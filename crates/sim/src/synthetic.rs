//! Random per-device workloads for the simulation.

use candle_core::{Device, Tensor};
use rand::Rng;

use embdist_core::config::PlacementConfig;

/// One device's random samples: a flat key list and a bucket range per
/// lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticBatch {
    keys: Vec<Vec<i64>>,
    bucket_ranges: Vec<Vec<u32>>,
}

impl SyntheticBatch {
    /// Draw `num_samples` samples. Each sample takes between 0 and
    /// `max_hotness` keys per lookup from `0..key_space`.
    pub fn generate<R: Rng>(
        placement: &PlacementConfig,
        num_samples: usize,
        key_space: i64,
        rng: &mut R,
    ) -> Self {
        let num_lookups = placement.num_lookups();
        let mut keys = Vec::with_capacity(num_lookups);
        let mut bucket_ranges = Vec::with_capacity(num_lookups);
        for lookup in &placement.lookups {
            let mut flat = Vec::with_capacity(num_samples * lookup.max_hotness);
            let mut range = Vec::with_capacity(num_samples + 1);
            range.push(0u32);
            for _ in 0..num_samples {
                let hotness = rng.gen_range(0..=lookup.max_hotness);
                flat.extend((0..hotness).map(|_| rng.gen_range(0..key_space)));
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

    pub fn num_samples(&self) -> usize {
        self.bucket_ranges
            .first()
            .map_or(0, |range| range.len() - 1)
    }

    pub fn num_keys(&self) -> usize {
        self.keys.iter().map(Vec::len).sum()
    }

    fn sample_keys(&self, lookup: usize, sample: usize) -> &[i64] {
        let range = &self.bucket_ranges[lookup];
        &self.keys[lookup][range[sample] as usize..range[sample + 1] as usize]
    }

    /// Data-parallel input: one key tensor and one bucket range tensor per
    /// lookup.
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

/// Full-batch input built from every device's samples in device order.
/// Buckets are batch-major: `sample * num_lookups + lookup`.
pub fn full_batch_tensors(
    batches: &[SyntheticBatch],
    device: &Device,
) -> candle_core::Result<(Tensor, Tensor)> {
    let mut keys = Vec::new();
    let mut range = vec![0u32];
    for batch in batches {
        for sample in 0..batch.num_samples() {
            for lookup in 0..batch.keys.len() {
                keys.extend_from_slice(batch.sample_keys(lookup, sample));
                range.push(keys.len() as u32);
            }
        }
    }
    Ok((
        Tensor::new(keys.as_slice(), device)?,
        Tensor::new(range.as_slice(), device)?,
    ))
}
