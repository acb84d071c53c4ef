//! Static placement of lookups, tables and shards across devices.
//!
//! The placement is supplied by the model configuration and stays immutable
//! for the lifetime of a distributor. Lookups (feature slots) reference a
//! table; every table belongs to exactly one group, and the group decides
//! whether keys of its tables are routed to shard owners (model parallel)
//! or stay on the device that read them (data parallel).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the tables of a group are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementMode {
    /// Tables are sharded; keys travel to the device owning their shard.
    #[serde(alias = "mp")]
    ModelParallel,
    /// Tables are replicated; keys stay local.
    #[serde(alias = "dp")]
    DataParallel,
}

impl std::fmt::Display for PlacementMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlacementMode::ModelParallel => write!(f, "mp"),
            PlacementMode::DataParallel => write!(f, "dp"),
        }
    }
}

/// One feature slot of the input batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupParam {
    /// Table this lookup reads from.
    pub table_id: usize,
    /// Maximum number of keys one sample may contribute.
    pub max_hotness: usize,
}

/// Shard layout of one embedding table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableParam {
    /// Owning device of each shard; the position is the shard index.
    pub shards: Vec<usize>,
}

/// A set of tables that share a placement mode and are exchanged together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupParam {
    pub mode: PlacementMode,
    pub table_ids: Vec<usize>,
}

/// Placement of every lookup and table of an embedding collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Number of devices taking part in every step.
    pub num_devices: usize,
    /// Largest global batch size a step may carry. Scratch and output
    /// buffers are sized against it.
    pub max_batch_size: usize,
    pub lookups: Vec<LookupParam>,
    pub tables: Vec<TableParam>,
    pub groups: Vec<GroupParam>,
}

/// Placement configuration errors. Raised at initialization only.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("num_devices must be > 0")]
    NoDevices,

    #[error("max_batch_size {max_batch_size} must be a positive multiple of num_devices {num_devices}")]
    BatchSize {
        max_batch_size: usize,
        num_devices: usize,
    },

    #[error("lookup {lookup_id} references table {table_id}, but only {num_tables} tables are configured")]
    UnknownTable {
        lookup_id: usize,
        table_id: usize,
        num_tables: usize,
    },

    #[error("{what} of {required} does not fit in u32 offsets")]
    OffsetOverflow { what: &'static str, required: u128 },

    #[error("lookup {lookup_id} has max_hotness 0")]
    ZeroHotness { lookup_id: usize },

    #[error("table {table_id} has no shards")]
    NoShards { table_id: usize },

    #[error("table {table_id} places a shard on device {device_id}, but num_devices = {num_devices}")]
    UnknownDevice {
        table_id: usize,
        device_id: usize,
        num_devices: usize,
    },

    #[error("table {table_id} places more than one shard on device {device_id}")]
    DuplicateShard { table_id: usize, device_id: usize },

    #[error("group {group_id} references table {table_id}, but only {num_tables} tables are configured")]
    GroupUnknownTable {
        group_id: usize,
        table_id: usize,
        num_tables: usize,
    },

    #[error("table {table_id} belongs to groups {first} and {second}")]
    TableInMultipleGroups {
        table_id: usize,
        first: usize,
        second: usize,
    },

    #[error("table {table_id} is not assigned to any group")]
    UngroupedTable { table_id: usize },

    #[error("data-parallel table {table_id} must be replicated on all {num_devices} devices, found {num_replicas}")]
    PartialReplica {
        table_id: usize,
        num_devices: usize,
        num_replicas: usize,
    },

    #[error("context list has {actual} entries, expected one per device ({expected})")]
    ContextCount { expected: usize, actual: usize },

    #[error("context {index} reports rank {rank} in a group of {world_size}")]
    ContextRank {
        index: usize,
        rank: usize,
        world_size: usize,
    },

    #[error("failed to read placement file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse placement config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl PlacementConfig {
    /// Parse and validate a placement from JSON.
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a placement file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Check that every reference resolves and every table is placed once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_devices == 0 {
            return Err(ConfigError::NoDevices);
        }
        if self.max_batch_size == 0 || self.max_batch_size % self.num_devices != 0 {
            return Err(ConfigError::BatchSize {
                max_batch_size: self.max_batch_size,
                num_devices: self.num_devices,
            });
        }

        let num_tables = self.tables.len();
        for (lookup_id, lookup) in self.lookups.iter().enumerate() {
            if lookup.table_id >= num_tables {
                return Err(ConfigError::UnknownTable {
                    lookup_id,
                    table_id: lookup.table_id,
                    num_tables,
                });
            }
            if lookup.max_hotness == 0 {
                return Err(ConfigError::ZeroHotness { lookup_id });
            }
        }

        for (table_id, table) in self.tables.iter().enumerate() {
            if table.shards.is_empty() {
                return Err(ConfigError::NoShards { table_id });
            }
            let mut seen = vec![false; self.num_devices];
            for &device_id in &table.shards {
                if device_id >= self.num_devices {
                    return Err(ConfigError::UnknownDevice {
                        table_id,
                        device_id,
                        num_devices: self.num_devices,
                    });
                }
                if seen[device_id] {
                    return Err(ConfigError::DuplicateShard {
                        table_id,
                        device_id,
                    });
                }
                seen[device_id] = true;
            }
        }

        let mut owner: Vec<Option<usize>> = vec![None; num_tables];
        for (group_id, group) in self.groups.iter().enumerate() {
            for &table_id in &group.table_ids {
                if table_id >= num_tables {
                    return Err(ConfigError::GroupUnknownTable {
                        group_id,
                        table_id,
                        num_tables,
                    });
                }
                if let Some(first) = owner[table_id] {
                    return Err(ConfigError::TableInMultipleGroups {
                        table_id,
                        first,
                        second: group_id,
                    });
                }
                owner[table_id] = Some(group_id);

                let num_replicas = self.tables[table_id].shards.len();
                if group.mode == PlacementMode::DataParallel && num_replicas != self.num_devices {
                    return Err(ConfigError::PartialReplica {
                        table_id,
                        num_devices: self.num_devices,
                        num_replicas,
                    });
                }
            }
        }
        if let Some(table_id) = owner.iter().position(Option::is_none) {
            return Err(ConfigError::UngroupedTable { table_id });
        }

        self.check_offset_range()?;

        Ok(())
    }

    /// Bucket offsets and key counts are carried as `u32`. The largest of
    /// each is reached at `max_batch_size` with every sample at full hotness.
    fn check_offset_range(&self) -> Result<(), ConfigError> {
        let max_batch_size = self.max_batch_size as u128;
        let num_buckets = self.lookups.len() as u128 * max_batch_size;
        let max_keys: u128 = self
            .lookups
            .iter()
            .map(|lookup| lookup.max_hotness as u128 * max_batch_size)
            .sum();
        for (what, required) in [("bucket count", num_buckets), ("key count", max_keys)] {
            if required > u32::MAX as u128 {
                return Err(ConfigError::OffsetOverflow { what, required });
            }
        }
        Ok(())
    }

    /// Total number of lookups (features) in a batch.
    pub fn num_lookups(&self) -> usize {
        self.lookups.len()
    }

    /// Samples each device holds for a given global batch size.
    pub fn batch_size_per_device(&self, batch_size: usize) -> usize {
        batch_size / self.num_devices
    }

    /// Group that owns a table, if any.
    pub fn table_group(&self, table_id: usize) -> Option<usize> {
        self.groups
            .iter()
            .position(|group| group.table_ids.contains(&table_id))
    }

    /// Group a lookup is exchanged in.
    ///
    /// # Panics
    /// Panics on an unvalidated config whose lookup table has no group.
    pub fn feature_id_to_group_id(&self, lookup_id: usize) -> usize {
        let table_id = self.lookups[lookup_id].table_id;
        self.table_group(table_id)
            .unwrap_or_else(|| panic!("table {table_id} of lookup {lookup_id} has no group"))
    }

    /// All lookups of a group, in lookup-id order.
    pub fn group_lookups(&self, group_id: usize) -> Vec<usize> {
        let tables = &self.groups[group_id].table_ids;
        self.lookups
            .iter()
            .enumerate()
            .filter(|(_, lookup)| tables.contains(&lookup.table_id))
            .map(|(lookup_id, _)| lookup_id)
            .collect()
    }

    /// Lookups of a group whose table has a shard on `device_id`.
    pub fn local_lookups(&self, group_id: usize, device_id: usize) -> Vec<usize> {
        self.group_lookups(group_id)
            .into_iter()
            .filter(|&lookup_id| {
                self.shard_index(self.lookups[lookup_id].table_id, device_id)
                    .is_some()
            })
            .collect()
    }

    /// Shard index a device holds for a table, if it holds one.
    pub fn shard_index(&self, table_id: usize, device_id: usize) -> Option<usize> {
        self.tables[table_id]
            .shards
            .iter()
            .position(|&owner| owner == device_id)
    }

    /// Tables with at least one shard on `device_id`.
    pub fn resident_tables(&self, device_id: usize) -> Vec<usize> {
        (0..self.tables.len())
            .filter(|&table_id| self.shard_index(table_id, device_id).is_some())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_GROUP_CONFIG: &str = r#"{
        "num_devices": 2,
        "max_batch_size": 8,
        "lookups": [
            { "table_id": 0, "max_hotness": 3 },
            { "table_id": 1, "max_hotness": 1 },
            { "table_id": 2, "max_hotness": 2 }
        ],
        "tables": [
            { "shards": [0, 1] },
            { "shards": [1] },
            { "shards": [0, 1] }
        ],
        "groups": [
            { "mode": "mp", "table_ids": [0, 1] },
            { "mode": "data_parallel", "table_ids": [2] }
        ]
    }"#;

    fn parsed() -> PlacementConfig {
        PlacementConfig::from_json_str(TWO_GROUP_CONFIG).unwrap()
    }

    #[test]
    fn parse_placement_json() {
        let config = parsed();
        assert_eq!(config.num_devices, 2);
        assert_eq!(config.num_lookups(), 3);
        assert_eq!(config.groups[0].mode, PlacementMode::ModelParallel);
        assert_eq!(config.groups[1].mode, PlacementMode::DataParallel);
    }

    #[test]
    fn lookups_resolve_to_groups() {
        let config = parsed();
        assert_eq!(config.feature_id_to_group_id(0), 0);
        assert_eq!(config.feature_id_to_group_id(1), 0);
        assert_eq!(config.feature_id_to_group_id(2), 1);
        assert_eq!(config.group_lookups(0), vec![0, 1]);
    }

    #[test]
    fn local_lookups_follow_shards() {
        let config = parsed();
        assert_eq!(config.local_lookups(0, 0), vec![0]);
        assert_eq!(config.local_lookups(0, 1), vec![0, 1]);
        assert_eq!(config.shard_index(0, 1), Some(1));
        assert_eq!(config.shard_index(1, 0), None);
        assert_eq!(config.resident_tables(0), vec![0, 2]);
    }

    #[test]
    fn rejects_unknown_table() {
        let mut config = parsed();
        config.lookups[1].table_id = 7;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownTable { lookup_id: 1, .. })
        ));
    }

    #[test]
    fn rejects_shard_on_missing_device() {
        let mut config = parsed();
        config.tables[1].shards = vec![3];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownDevice { device_id: 3, .. })
        ));
    }

    #[test]
    fn rejects_table_in_two_groups() {
        let mut config = parsed();
        config.groups[1].table_ids.push(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TableInMultipleGroups { table_id: 0, .. })
        ));
    }

    #[test]
    fn rejects_ungrouped_table() {
        let mut config = parsed();
        config.groups[0].table_ids = vec![0];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UngroupedTable { table_id: 1 })
        ));
    }

    #[test]
    fn rejects_partial_dp_replica() {
        let mut config = parsed();
        config.tables[2].shards = vec![0];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PartialReplica { table_id: 2, .. })
        ));
    }

    #[test]
    fn rejects_key_count_past_u32() {
        let mut config = parsed();
        config.max_batch_size = 1 << 30;
        config.lookups[0].max_hotness = 4;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OffsetOverflow {
                what: "key count",
                ..
            })
        ));

        config.lookups[0].max_hotness = 1;
        config.lookups[2].max_hotness = 1;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bucket_count_past_u32() {
        let mut config = parsed();
        config.max_batch_size = 1 << 31;
        for lookup in &mut config.lookups {
            lookup.max_hotness = 1;
        }
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OffsetOverflow {
                what: "bucket count",
                required,
            }) if required == 3 << 31
        ));
    }

    #[test]
    fn rejects_batch_not_divisible_by_devices() {
        let mut config = parsed();
        config.max_batch_size = 7;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BatchSize { .. })
        ));
    }

    #[test]
    fn serde_roundtrip_keeps_mode_names() {
        let config = parsed();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"model_parallel\""));
        let back = PlacementConfig::from_json_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
