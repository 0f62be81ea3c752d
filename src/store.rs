use dashmap::{DashMap, DashSet};
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::debug;

use crate::block::{Block, BlockId};
use crate::pending::PendingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Pending,
    Committed,
    Dead,
    Unknown,
}

#[derive(Debug, Default)]
pub struct CommittedStore {
    blocks: DashMap<BlockId, Block>,
}

impl CommittedStore {
    /// First commit wins; later copies of the same block are dropped.
    pub fn insert(&self, block: Block) -> bool {
        match self.blocks.entry(block.id()) {
            Entry::Vacant(slot) => {
                slot.insert(block);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    pub fn get(&self, id: BlockId) -> Option<Block> {
        self.blocks.get(&id).map(|b| b.clone())
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Every lifecycle bucket a server keeps. A block id sits in at most one of
/// pending, committed and dead, and never returns to pending once committed.
#[derive(Debug, Default)]
pub struct Stores {
    pub pending: PendingStore,
    pub committed: CommittedStore,
    dead: DashSet<BlockId>,
    // Blocks whose body is known to have reached every peer.
    synced: DashSet<BlockId>,
    // Held across the check and the move of every bucket transition.
    settle: Mutex<()>,
}

impl Stores {
    pub fn is_dead(&self, id: BlockId) -> bool {
        self.dead.contains(&id)
    }

    /// Excludes a block from further voting. Committed blocks stay committed.
    pub fn mark_dead(&self, id: BlockId) -> bool {
        let _settle = self.settle.lock();
        if self.committed.contains(id) {
            return false;
        }
        let fresh = self.dead.insert(id);
        self.pending.remove(id);
        self.synced.remove(&id);
        fresh
    }

    pub fn dead_count(&self) -> usize {
        self.dead.len()
    }

    /// Settled blocks are never revealed again, so they are not tracked.
    pub fn mark_synced(&self, id: BlockId) {
        let _settle = self.settle.lock();
        if !self.committed.contains(id) && !self.is_dead(id) {
            self.synced.insert(id);
        }
    }

    pub fn synced_count(&self) -> usize {
        self.synced.len()
    }

    pub fn is_synced(&self, id: BlockId) -> bool {
        self.synced.contains(&id)
    }

    /// Pending insert for a block body arriving from anywhere. Ids already
    /// committed or dead are refused.
    pub fn admit(&self, block: Block) -> bool {
        let id = block.id();
        let _settle = self.settle.lock();
        if self.committed.contains(id) || self.is_dead(id) {
            debug!(block_id = id, "refusing settled block");
            return false;
        }
        self.pending.insert(block)
    }

    /// Moves a merged block into the committed store, dropping any pending copy.
    pub fn commit(&self, mut block: Block) -> bool {
        let id = block.id();
        let _settle = self.settle.lock();
        if self.is_dead(id) {
            debug!(block_id = id, "ignoring commit of dead block");
            return false;
        }
        self.pending.remove(id);
        self.synced.remove(&id);
        block.header.stamp_receive();
        self.committed.insert(block)
    }

    pub fn lifecycle(&self, id: BlockId) -> Lifecycle {
        if self.committed.contains(id) {
            Lifecycle::Committed
        } else if self.is_dead(id) {
            Lifecycle::Dead
        } else if self.pending.contains(id) {
            Lifecycle::Pending
        } else {
            Lifecycle::Unknown
        }
    }
}
