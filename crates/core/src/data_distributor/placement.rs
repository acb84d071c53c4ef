//! Injected key-to-shard and key-to-index rules.
//!
//! The distributor never decides on its own which shard owns a key or where
//! a key lives inside a shard. Both rules are pure functions supplied by the
//! caller through [`Sharding`]; the engine only evaluates them.
//!
//! ## Shipped rules
//!
//! - [`ModuloPlacement`]: shard = `key mod num_shards`, index = `key div num_shards`.
//! - [`ExplicitPlacement`]: an explicit key table with dictionary indices,
//!   falling back to the modulo rule for unlisted keys.
//! - [`IdentityIndex`]: index = key (replicated tables).

use std::collections::HashMap;
use std::sync::Arc;

/// Maps a key of a table to the shard that owns it.
pub trait ShardPlacement: Send + Sync {
    /// Shard index in `0..num_shards` owning `key`.
    fn shard_of(&self, table_id: usize, key: i64, num_shards: usize) -> usize;
}

/// Maps a key to its row inside the shard that owns it.
pub trait KeyToIndex: Send + Sync {
    fn local_index(&self, table_id: usize, key: i64, shard: usize, num_shards: usize) -> i64;
}

/// Round-robin placement of keys over shards.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuloPlacement;

impl ShardPlacement for ModuloPlacement {
    #[inline]
    fn shard_of(&self, _table_id: usize, key: i64, num_shards: usize) -> usize {
        key.rem_euclid(num_shards as i64) as usize
    }
}

impl KeyToIndex for ModuloPlacement {
    #[inline]
    fn local_index(&self, _table_id: usize, key: i64, _shard: usize, num_shards: usize) -> i64 {
        key.div_euclid(num_shards as i64)
    }
}

/// Keys are their own row index.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityIndex;

impl KeyToIndex for IdentityIndex {
    #[inline]
    fn local_index(&self, _table_id: usize, key: i64, _shard: usize, _num_shards: usize) -> i64 {
        key
    }
}

/// Explicit key ownership table.
///
/// Each assigned key gets the next free row of its (table, shard) pair, in
/// assignment order. Keys that were never assigned use [`ModuloPlacement`].
#[derive(Debug, Clone, Default)]
pub struct ExplicitPlacement {
    owners: HashMap<(usize, i64), (usize, i64)>,
    next_row: HashMap<(usize, usize), i64>,
}

impl ExplicitPlacement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `key` of `table_id` to `shard`. Re-assigning a key keeps the
    /// first assignment.
    pub fn assign(mut self, table_id: usize, key: i64, shard: usize) -> Self {
        if !self.owners.contains_key(&(table_id, key)) {
            let row = self.next_row.entry((table_id, shard)).or_insert(0);
            self.owners.insert((table_id, key), (shard, *row));
            *row += 1;
        }
        self
    }

    /// Number of explicitly assigned keys.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

impl ShardPlacement for ExplicitPlacement {
    fn shard_of(&self, table_id: usize, key: i64, num_shards: usize) -> usize {
        match self.owners.get(&(table_id, key)) {
            Some(&(shard, _)) => shard,
            None => ModuloPlacement.shard_of(table_id, key, num_shards),
        }
    }
}

impl KeyToIndex for ExplicitPlacement {
    fn local_index(&self, table_id: usize, key: i64, shard: usize, num_shards: usize) -> i64 {
        match self.owners.get(&(table_id, key)) {
            Some(&(_, row)) => row,
            None => ModuloPlacement.local_index(table_id, key, shard, num_shards),
        }
    }
}

/// The injected rules a distributor is built with.
#[derive(Clone)]
pub struct Sharding {
    /// Owner shard of a model-parallel key.
    pub placement: Arc<dyn ShardPlacement>,
    /// Row of a model-parallel key inside its shard.
    pub mp_index: Arc<dyn KeyToIndex>,
    /// Row of a data-parallel key inside its replica.
    pub dp_index: Arc<dyn KeyToIndex>,
}

impl Sharding {
    pub fn new(
        placement: Arc<dyn ShardPlacement>,
        mp_index: Arc<dyn KeyToIndex>,
        dp_index: Arc<dyn KeyToIndex>,
    ) -> Self {
        Self {
            placement,
            mp_index,
            dp_index,
        }
    }

    /// Explicit placement for model-parallel keys, identity rows for replicas.
    pub fn explicit(placement: ExplicitPlacement) -> Self {
        let placement = Arc::new(placement);
        Self {
            placement: placement.clone(),
            mp_index: placement,
            dp_index: Arc::new(IdentityIndex),
        }
    }
}

impl Default for Sharding {
    fn default() -> Self {
        Self {
            placement: Arc::new(ModuloPlacement),
            mp_index: Arc::new(ModuloPlacement),
            dp_index: Arc::new(IdentityIndex),
        }
    }
}

impl std::fmt::Debug for Sharding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sharding").finish_non_exhaustive()
    }
}
