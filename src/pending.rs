//! Pending-block store and the block ownership function.
//!
//! Locking is two-tier. A traversal takes [`PendingStore::scan`], which holds the
//! global read lock for as long as the returned [`ScanGuard`] lives. Structural
//! mutators (insert, remove, vote-then-maybe-remove) take the global write lock
//! only around the single map operation. Point reads hold a per-key guard.
//! Every guard releases on drop.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use parking_lot::{RwLock, RwLockReadGuard};
use smallvec::SmallVec;

use crate::block::{Block, BlockHeader, BlockId, BlockVote, ServerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Shadow,
}

/// The servers responsible for committing a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owners {
    pub primary: ServerId,
    pub shadow: ServerId,
}

impl Owners {
    pub fn role(&self, server: ServerId) -> Option<Role> {
        if server == self.primary {
            Some(Role::Primary)
        } else if server == self.shadow {
            Some(Role::Shadow)
        } else {
            None
        }
    }

    pub fn contains(&self, server: ServerId) -> bool {
        self.role(server).is_some()
    }

    pub fn members(&self) -> SmallVec<[ServerId; 2]> {
        let mut members = SmallVec::new();
        members.push(self.primary);
        if self.shadow != self.primary {
            members.push(self.shadow);
        }
        members
    }
}

/// Primary is `(id mod n) + 1`, shadow is the next server around the ring.
/// Servers are numbered from 1. With a single server both roles collapse onto it.
pub fn owning_servers(block_id: BlockId, server_count: u64) -> Owners {
    let n = server_count.max(1);
    let primary = block_id % n + 1;
    let shadow = primary % n + 1;
    Owners { primary, shadow }
}

pub type BlockRef<'a> = Ref<'a, BlockId, Block>;

#[derive(Debug)]
pub enum VoteOutcome {
    Unknown,
    Recorded { votes: usize },
    /// Quorum reached; the block has left the store and belongs to the caller.
    Quorum(Block),
}

#[derive(Debug, Default)]
pub struct PendingStore {
    blocks: DashMap<BlockId, Block>,
    scan: RwLock<()>,
}

pub struct ScanGuard<'a> {
    _lock: RwLockReadGuard<'a, ()>,
    blocks: &'a DashMap<BlockId, Block>,
}

impl<'a> ScanGuard<'a> {
    /// Copies of every pending header, consistent for the lifetime of the guard.
    pub fn headers(&self) -> impl Iterator<Item = BlockHeader> + '_ {
        self.blocks.iter().map(|entry| entry.header.clone())
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().map(|entry| *entry.key())
    }
}

impl PendingStore {
    pub fn scan(&self) -> ScanGuard<'_> {
        ScanGuard { _lock: self.scan.read(), blocks: &self.blocks }
    }

    pub fn get(&self, id: BlockId) -> Option<BlockRef<'_>> {
        self.blocks.get(&id)
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Replace-if-absent. Returns whether the block was inserted.
    pub fn insert(&self, block: Block) -> bool {
        let _w = self.scan.write();
        match self.blocks.entry(block.id()) {
            Entry::Vacant(slot) => {
                slot.insert(block);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn remove(&self, id: BlockId) -> Option<Block> {
        let _w = self.scan.write();
        self.blocks.remove(&id).map(|(_, block)| block)
    }

    /// Inserts the vote and, if that completes the quorum, removes the block,
    /// all under the block's shard lock so only one caller ever sees the quorum.
    pub fn apply_vote(&self, vote: BlockVote, quorum: usize) -> VoteOutcome {
        let id = vote.block_id;
        let mut recorded = None;
        let _w = self.scan.write();
        let removed = self.blocks.remove_if_mut(&id, |_, block| {
            block.insert_vote(vote);
            recorded = Some(block.votes.len());
            block.votes.len() >= quorum
        });
        match (removed, recorded) {
            (Some((_, block)), _) => VoteOutcome::Quorum(block),
            (None, Some(votes)) => VoteOutcome::Recorded { votes },
            (None, None) => VoteOutcome::Unknown,
        }
    }
}
