//! Data-parallel key filtering.
//!
//! Keys of replicated tables never leave the device. The filter only
//! concatenates the local lookups' keys and bucket ranges into the output
//! layout and converts the keys to replica rows.

use super::batch::LocalBatch;
use super::error::Result;
use super::key_filter::DpKeySelector;
use super::output::EmbeddingInput;

/// Concatenate the selected lookups' keys and bucket ranges into `output`.
///
/// `output` must already be started with `batch.num_samples()` buckets per
/// lookup. Returns the number of keys written.
pub fn concat_keys_and_bucket_range(
    selector: &DpKeySelector,
    batch: &LocalBatch,
    output: &mut EmbeddingInput,
) -> Result<usize> {
    let required: usize = selector
        .lookup_ids
        .iter()
        .map(|&lookup_id| batch.keys(lookup_id).len())
        .sum();
    output.reserve_keys(required)?;

    let b = batch.num_samples();
    let (keys, bucket_range) = output.buffers_mut();
    let mut written = 0usize;
    bucket_range[0] = 0;
    for (j, &lookup_id) in selector.lookup_ids.iter().enumerate() {
        let lookup_keys = batch.keys(lookup_id);
        keys[written..written + lookup_keys.len()].copy_from_slice(lookup_keys);

        let range = batch.bucket_range(lookup_id);
        let base = written as u32;
        for (dst, &offset) in bucket_range[j * b + 1..(j + 1) * b + 1]
            .iter_mut()
            .zip(&range[1..])
        {
            *dst = base + offset;
        }
        written += lookup_keys.len();
    }
    output.finish();
    Ok(written)
}
