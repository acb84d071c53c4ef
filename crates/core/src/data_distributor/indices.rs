//! Conversion of global keys into rows of the local table shard.
//!
//! Runs after the keys of a group have arrived on the device that owns them.
//! Conversion rewrites key values in place, lookup by lookup; bucket
//! boundaries are left untouched so the per-sample grouping survives.

use std::sync::Arc;

use super::placement::KeyToIndex;

/// Shard a device holds for one of its local lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalShard {
    pub lookup_id: usize,
    pub table_id: usize,
    pub shard: usize,
    pub num_shards: usize,
}

/// Per-device index rule for the local lookups of one group.
#[derive(Clone)]
pub struct IndexCalculation {
    local: Vec<LocalShard>,
    index: Arc<dyn KeyToIndex>,
}

impl IndexCalculation {
    pub fn new(local: Vec<LocalShard>, index: Arc<dyn KeyToIndex>) -> Self {
        Self { local, index }
    }

    /// Local lookups in output order.
    pub fn local_shards(&self) -> &[LocalShard] {
        &self.local
    }

    /// Rewrite the keys of the `local_idx`-th local lookup into shard rows.
    pub fn convert(&self, local_idx: usize, keys: &mut [i64]) {
        let shard = &self.local[local_idx];
        for key in keys.iter_mut() {
            *key = self
                .index
                .local_index(shard.table_id, *key, shard.shard, shard.num_shards);
        }
    }

    /// Rewrite a feature-major key buffer whose lookup `j` occupies
    /// `keys[lookup_offsets[j]..lookup_offsets[j + 1]]`.
    pub fn convert_all(&self, keys: &mut [i64], lookup_offsets: &[u32]) {
        debug_assert_eq!(lookup_offsets.len(), self.local.len() + 1);
        for (j, window) in lookup_offsets.windows(2).enumerate() {
            let (start, end) = (window[0] as usize, window[1] as usize);
            self.convert(j, &mut keys[start..end]);
        }
    }
}

impl std::fmt::Debug for IndexCalculation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCalculation")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}
