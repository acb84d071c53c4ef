use crate::config::{GroupParam, LookupParam, PlacementConfig, PlacementMode, TableParam};

/// One model-parallel lookup over a table with one shard per device.
/// Max batch of 4 samples per device, hotness 2.
pub fn tiny_mp_config(num_devices: usize) -> PlacementConfig {
    PlacementConfig {
        num_devices,
        max_batch_size: 4 * num_devices,
        lookups: vec![LookupParam {
            table_id: 0,
            max_hotness: 2,
        }],
        tables: vec![TableParam {
            shards: (0..num_devices).collect(),
        }],
        groups: vec![GroupParam {
            mode: PlacementMode::ModelParallel,
            table_ids: vec![0],
        }],
    }
}

/// One data-parallel lookup over a table replicated on every device.
pub fn tiny_dp_config(num_devices: usize, max_batch_size: usize) -> PlacementConfig {
    PlacementConfig {
        num_devices,
        max_batch_size,
        lookups: vec![LookupParam {
            table_id: 0,
            max_hotness: 3,
        }],
        tables: vec![TableParam {
            shards: (0..num_devices).collect(),
        }],
        groups: vec![GroupParam {
            mode: PlacementMode::DataParallel,
            table_ids: vec![0],
        }],
    }
}

/// Mixed placement exercising every routing case:
///
/// - group 0 (mp): lookup 0 on table 0, sharded over all devices; lookup 1
///   on table 1, a single shard on the last device; lookup 2 reads table 0
///   again;
/// - group 1 (dp): lookup 3 on table 2, replicated.
///
/// Max batch of 8 samples per device.
pub fn tiny_mixed_config(num_devices: usize) -> PlacementConfig {
    PlacementConfig {
        num_devices,
        max_batch_size: 8 * num_devices,
        lookups: vec![
            LookupParam {
                table_id: 0,
                max_hotness: 3,
            },
            LookupParam {
                table_id: 1,
                max_hotness: 1,
            },
            LookupParam {
                table_id: 0,
                max_hotness: 2,
            },
            LookupParam {
                table_id: 2,
                max_hotness: 4,
            },
        ],
        tables: vec![
            TableParam {
                shards: (0..num_devices).collect(),
            },
            TableParam {
                shards: vec![num_devices - 1],
            },
            TableParam {
                shards: (0..num_devices).collect(),
            },
        ],
        groups: vec![
            GroupParam {
                mode: PlacementMode::ModelParallel,
                table_ids: vec![0, 1],
            },
            GroupParam {
                mode: PlacementMode::DataParallel,
                table_ids: vec![2],
            },
        ],
    }
}
