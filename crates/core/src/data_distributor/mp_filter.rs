//! Model-parallel key filtering.
//!
//! Runs on the sending side of a model-parallel group, before any exchange:
//!
//! 1. **label**: every key of the group's lookups gets the id of the
//!    device owning its shard;
//! 2. **count**: keys are counted per (destination, lookup, sample), the
//!    destination-major layout the count exchange needs;
//! 3. **scan + sort**: an exclusive scan of the per-destination totals
//!    drives a stable counting sort, leaving one contiguous segment per
//!    destination with the original lookup/sample order inside;
//! 4. **swizzle**: per destination, the segment total followed by the
//!    per-bucket counts of the lookups that destination holds becomes the
//!    count message.
//!
//! On the receiving side the counts are transposed from source-major to
//! feature-major so bucket boundaries can be rebuilt locally.
//!
//! All buffers are sized from the placement at construction and reused.

use super::batch::LocalBatch;
use super::error::{DistributorError, ExchangePhase, Result};
use super::key_filter::MpKeySelector;

/// Scratch storage of one model-parallel group on one device.
#[derive(Debug)]
pub struct FilterTempStorage {
    num_devices: usize,
    /// Lookups of the group.
    num_lookups: usize,
    /// Lookup positions within the group held by each destination.
    dest_lookups: Vec<Vec<usize>>,
    /// Number of group lookups this device holds.
    num_local_lookups: usize,
    /// Samples per device of the current step.
    batch_size_per_device: usize,

    /// Input keys of the group, lookup-major then sample-major.
    keys: Vec<i64>,
    /// Destination of each key in `keys`.
    labels: Vec<u32>,
    /// Keys sorted by destination.
    sorted_keys: Vec<i64>,
    /// `[dest][lookup][sample]` key counts.
    k_per_b_gpu_major: Vec<u32>,
    /// Keys sent to each destination.
    k_per_g: Vec<u32>,
    /// Sort cursors, seeded from the exclusive scan of `k_per_g`.
    sort_cursor: Vec<u32>,
    /// Count message, one section per destination.
    send_counts: Vec<u32>,
    send_count_splits: Vec<usize>,
    /// Keys received from each source.
    recv_k_per_g: Vec<u32>,
    /// `[lookup][src][sample]` received key counts.
    k_per_b_feat_major: Vec<u32>,
}

impl FilterTempStorage {
    /// Size the storage for `max_keys` group keys and `max_samples` samples
    /// per device.
    ///
    /// `dest_lookups[d]` lists the positions (within the group) of the
    /// lookups whose table has a shard on device `d`.
    pub fn new(
        num_devices: usize,
        num_lookups: usize,
        dest_lookups: Vec<Vec<usize>>,
        device_id: usize,
        max_samples: usize,
        max_keys: usize,
    ) -> Self {
        let num_local_lookups = dest_lookups[device_id].len();
        let count_words: usize = dest_lookups
            .iter()
            .map(|lookups| 1 + lookups.len() * max_samples)
            .sum();
        Self {
            num_devices,
            num_lookups,
            num_local_lookups,
            batch_size_per_device: 0,
            keys: Vec::with_capacity(max_keys),
            labels: Vec::with_capacity(max_keys),
            sorted_keys: vec![0; max_keys],
            k_per_b_gpu_major: vec![0; num_devices * num_lookups * max_samples],
            k_per_g: vec![0; num_devices],
            sort_cursor: vec![0; num_devices],
            send_counts: Vec::with_capacity(count_words),
            send_count_splits: vec![0; num_devices],
            recv_k_per_g: vec![0; num_devices],
            k_per_b_feat_major: vec![0; num_local_lookups * num_devices * max_samples],
            dest_lookups,
        }
    }

    pub fn num_local_lookups(&self) -> usize {
        self.num_local_lookups
    }

    pub fn batch_size_per_device(&self) -> usize {
        self.batch_size_per_device
    }

    #[cfg(test)]
    pub(crate) fn set_batch_size_per_device(&mut self, b: usize) {
        self.batch_size_per_device = b;
    }

    /// Keys this device sends to each destination in the current step.
    pub fn send_k_per_g(&self) -> &[u32] {
        &self.k_per_g
    }

    /// Keys this device receives from each source in the current step.
    pub fn recv_k_per_g(&self) -> &[u32] {
        &self.recv_k_per_g
    }

    pub fn total_sent(&self) -> usize {
        self.k_per_g.iter().map(|&n| n as usize).sum()
    }

    pub fn total_received(&self) -> usize {
        self.recv_k_per_g.iter().map(|&n| n as usize).sum()
    }

    /// Send buffer of the payload exchange, grouped by destination.
    pub fn sorted_keys(&self) -> &[i64] {
        &self.sorted_keys[..self.total_sent()]
    }

    /// Count message of the count exchange.
    pub fn send_counts(&self) -> &[u32] {
        &self.send_counts
    }

    /// Words sent to each destination in the count exchange.
    pub fn send_count_splits(&self) -> &[usize] {
        &self.send_count_splits
    }

    /// Words received from each source in the count exchange.
    pub fn recv_count_split(&self) -> usize {
        1 + self.num_local_lookups * self.batch_size_per_device
    }

    /// Received key counts in `[lookup][src][sample]` order.
    pub fn k_per_b_feat_major(&self) -> &[u32] {
        let len = self.num_local_lookups * self.num_devices * self.batch_size_per_device;
        &self.k_per_b_feat_major[..len]
    }

    /// Label the group's keys with their destination and count them.
    ///
    /// `lookup_ids` are the group's lookups in the selector's order.
    pub fn label_and_count(
        &mut self,
        selector: &MpKeySelector,
        batch: &LocalBatch,
        lookup_ids: &[usize],
    ) -> Result<()> {
        let b = batch.num_samples();
        let num_lookups = self.num_lookups;
        debug_assert_eq!(lookup_ids.len(), num_lookups);
        self.batch_size_per_device = b;

        let required: usize = lookup_ids.iter().map(|&l| batch.keys(l).len()).sum();
        if required > self.sorted_keys.len() {
            return Err(DistributorError::CapacityExceeded {
                what: "group keys",
                required,
                capacity: self.sorted_keys.len(),
            });
        }

        self.keys.clear();
        self.labels.clear();
        self.k_per_g.fill(0);
        let counts = &mut self.k_per_b_gpu_major[..self.num_devices * num_lookups * b];
        counts.fill(0);

        for (k, &lookup_id) in lookup_ids.iter().enumerate() {
            let keys = batch.keys(lookup_id);
            let range = batch.bucket_range(lookup_id);
            for s in 0..b {
                for &key in &keys[range[s] as usize..range[s + 1] as usize] {
                    let dest = selector.destination(k, key)?;
                    self.keys.push(key);
                    self.labels.push(dest as u32);
                    counts[(dest * num_lookups + k) * b + s] += 1;
                    self.k_per_g[dest] += 1;
                }
            }
        }
        Ok(())
    }

    /// Stable counting sort of the labeled keys by destination.
    pub fn scan_and_sort(&mut self) {
        let mut acc = 0u32;
        for (cursor, &count) in self.sort_cursor.iter_mut().zip(&self.k_per_g) {
            *cursor = acc;
            acc += count;
        }
        for (&key, &dest) in self.keys.iter().zip(&self.labels) {
            let slot = &mut self.sort_cursor[dest as usize];
            self.sorted_keys[*slot as usize] = key;
            *slot += 1;
        }
    }

    /// Build the count message: for each destination, its key total followed
    /// by the per-bucket counts of the lookups it holds.
    ///
    /// Lookups a destination does not hold never route keys to it, so their
    /// counts are left out.
    pub fn swizzle_counts(&mut self) {
        let b = self.batch_size_per_device;
        self.send_counts.clear();
        for dest in 0..self.num_devices {
            let lookups = &self.dest_lookups[dest];
            self.send_counts.push(self.k_per_g[dest]);
            for &k in lookups {
                let start = (dest * self.num_lookups + k) * b;
                self.send_counts
                    .extend_from_slice(&self.k_per_b_gpu_major[start..start + b]);
            }
            self.send_count_splits[dest] = 1 + lookups.len() * b;
        }
    }

    /// Read the received count message and transpose it to feature-major.
    ///
    /// Every source section must announce a total equal to the sum of its
    /// per-bucket counts. The announced totals are kept even when a section
    /// is inconsistent so the payload exchange can still run to completion.
    pub fn transpose_buckets(&mut self, received: &[u32]) -> Result<()> {
        let b = self.batch_size_per_device;
        let split = self.recv_count_split();
        let expected = split * self.num_devices;
        if received.len() != expected {
            self.recv_k_per_g.fill(0);
            return Err(DistributorError::protocol(
                ExchangePhase::Counts,
                format!("received {} count words, expected {expected}", received.len()),
            ));
        }

        let mut fault = None;
        for (src, section) in received.chunks(split).enumerate() {
            let total = section[0];
            self.recv_k_per_g[src] = total;
            let buckets = &section[1..];
            let sum: u64 = buckets.iter().map(|&n| n as u64).sum();
            if sum != total as u64 && fault.is_none() {
                fault = Some(DistributorError::protocol(
                    ExchangePhase::Counts,
                    format!("device {src} announced {total} keys but its bucket counts sum to {sum}"),
                ));
            }
            for j in 0..self.num_local_lookups {
                let dst = (j * self.num_devices + src) * b;
                self.k_per_b_feat_major[dst..dst + b]
                    .copy_from_slice(&buckets[j * b..(j + 1) * b]);
            }
        }
        match fault {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
