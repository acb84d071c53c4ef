//! Rank identity inside a device group.
//!
//! Every device of a distribution step runs its own pipeline; the only thing
//! the pipeline needs to know about the group is its own rank and the number
//! of ranks, since bucket layouts and shard ownership are indexed by both.

use super::error::{DistributedError, Result};

/// Rank and size of the group a communicator belongs to.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this device, in `0..world_size`.
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// A group of one: collectives are identity.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// Plain rank record, for communicators that know their rank up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMember {
    rank: usize,
    world_size: usize,
}

impl GroupMember {
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        Ok(Self { rank, world_size })
    }

    /// Every member of a group of `world_size`, in rank order.
    pub fn all(world_size: usize) -> Vec<Self> {
        (0..world_size)
            .map(|rank| Self { rank, world_size })
            .collect()
    }

    /// Ranks other than this one, ascending.
    pub fn peers(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.world_size).filter(move |&r| r != self.rank)
    }
}

impl ProcessGroup for GroupMember {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_of_single_group() {
        let member = GroupMember::new(0, 1).unwrap();
        assert!(member.is_single());
        assert_eq!(member.peers().count(), 0);
    }

    #[test]
    fn all_members_in_rank_order() {
        let members = GroupMember::all(4);
        assert_eq!(members.len(), 4);
        assert_eq!(members[2].rank(), 2);
        assert_eq!(members[2].world_size(), 4);
        assert_eq!(members[2].peers().collect::<Vec<_>>(), vec![0, 1, 3]);
    }

    #[test]
    fn rank_outside_group_is_rejected() {
        assert!(matches!(
            GroupMember::new(4, 4),
            Err(DistributedError::InvalidRank {
                rank: 4,
                world_size: 4
            })
        ));
    }
}
