//! Per-group key filters.
//!
//! Every (group, device) pair gets one [`KeyFilter`], built once when the
//! distributor is created. The variant is fixed by the group's placement
//! mode, so dispatch happens per group rather than per key:
//!
//! - **ModelParallel**: the selector names the destination device of each
//!   key; the index calculation turns received keys into shard rows.
//! - **DataParallel**: the selector picks the local lookups whose keys stay
//!   on the device; the index calculation maps them into the replica.

use std::sync::Arc;

use super::error::{DistributorError, Result};
use super::indices::{IndexCalculation, LocalShard};
use super::placement::{ShardPlacement, Sharding};
use crate::config::{PlacementConfig, PlacementMode};

/// Shard owners of one lookup of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupShards {
    pub lookup_id: usize,
    pub table_id: usize,
    /// Device owning each shard of the lookup's table.
    pub shard_devices: Vec<usize>,
}

/// Destination selector for model-parallel keys.
#[derive(Clone)]
pub struct MpKeySelector {
    lookups: Vec<LookupShards>,
    placement: Arc<dyn ShardPlacement>,
}

impl MpKeySelector {
    pub fn new(lookups: Vec<LookupShards>, placement: Arc<dyn ShardPlacement>) -> Self {
        Self { lookups, placement }
    }

    /// All lookups of the group, in lookup-id order.
    pub fn lookups(&self) -> &[LookupShards] {
        &self.lookups
    }

    /// Device that owns `key` of the group's `lookup_idx`-th lookup.
    #[inline]
    pub fn destination(&self, lookup_idx: usize, key: i64) -> Result<usize> {
        let lookup = &self.lookups[lookup_idx];
        let num_shards = lookup.shard_devices.len();
        let shard = self.placement.shard_of(lookup.table_id, key, num_shards);
        lookup
            .shard_devices
            .get(shard)
            .copied()
            .ok_or(DistributorError::InvalidShard {
                table_id: lookup.table_id,
                key,
                shard,
                num_shards,
            })
    }
}

impl std::fmt::Debug for MpKeySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpKeySelector")
            .field("lookups", &self.lookups)
            .finish_non_exhaustive()
    }
}

/// Local lookup selector for data-parallel keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpKeySelector {
    /// Global lookup ids whose keys this device keeps, in output order.
    pub lookup_ids: Vec<usize>,
}

/// Key filter of one group on one device.
#[derive(Debug, Clone)]
pub enum KeyFilter {
    ModelParallel {
        selector: MpKeySelector,
        index_calc: IndexCalculation,
    },
    DataParallel {
        selector: DpKeySelector,
        index_calc: IndexCalculation,
    },
}

impl KeyFilter {
    /// Build the filter of `group_id` for `device_id`.
    ///
    /// The config must already be validated.
    pub fn build(
        config: &PlacementConfig,
        group_id: usize,
        device_id: usize,
        sharding: &Sharding,
    ) -> Self {
        let local: Vec<LocalShard> = config
            .local_lookups(group_id, device_id)
            .into_iter()
            .filter_map(|lookup_id| {
                let table_id = config.lookups[lookup_id].table_id;
                let shard = config.shard_index(table_id, device_id)?;
                Some(LocalShard {
                    lookup_id,
                    table_id,
                    shard,
                    num_shards: config.tables[table_id].shards.len(),
                })
            })
            .collect();

        match config.groups[group_id].mode {
            PlacementMode::ModelParallel => {
                let lookups = config
                    .group_lookups(group_id)
                    .into_iter()
                    .map(|lookup_id| {
                        let table_id = config.lookups[lookup_id].table_id;
                        LookupShards {
                            lookup_id,
                            table_id,
                            shard_devices: config.tables[table_id].shards.clone(),
                        }
                    })
                    .collect();
                KeyFilter::ModelParallel {
                    selector: MpKeySelector::new(lookups, sharding.placement.clone()),
                    index_calc: IndexCalculation::new(local, sharding.mp_index.clone()),
                }
            }
            PlacementMode::DataParallel => KeyFilter::DataParallel {
                selector: DpKeySelector {
                    lookup_ids: local.iter().map(|shard| shard.lookup_id).collect(),
                },
                index_calc: IndexCalculation::new(local, sharding.dp_index.clone()),
            },
        }
    }

    pub fn mode(&self) -> PlacementMode {
        match self {
            KeyFilter::ModelParallel { .. } => PlacementMode::ModelParallel,
            KeyFilter::DataParallel { .. } => PlacementMode::DataParallel,
        }
    }

    pub fn index_calc(&self) -> &IndexCalculation {
        match self {
            KeyFilter::ModelParallel { index_calc, .. } => index_calc,
            KeyFilter::DataParallel { index_calc, .. } => index_calc,
        }
    }

    /// Lookups this device emits for the group, in output order.
    pub fn local_shards(&self) -> &[LocalShard] {
        self.index_calc().local_shards()
    }
}
