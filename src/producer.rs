use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::block::{Block, BlockId, IdSequence, ServerId};
use crate::relay::RelayQueues;
use crate::store::Stores;
use crate::txn::Pool;

/// Packs pooled transactions into blocks and hands them to the relay.
pub struct BlockProducer {
    ids: IdSequence,
    // Most recent block id produced here; chains `base_id`.
    last: AtomicU64,
    pool: Arc<Pool>,
    stores: Arc<Stores>,
    queues: Arc<RelayQueues>,
    batch_size: usize,
    pool_limit: usize,
}

impl BlockProducer {
    pub fn new(
        server_id: ServerId,
        pool: Arc<Pool>,
        stores: Arc<Stores>,
        queues: Arc<RelayQueues>,
        batch_size: usize,
        pool_limit: usize,
    ) -> Self {
        Self {
            ids: IdSequence::new(server_id),
            last: AtomicU64::new(0),
            pool,
            stores,
            queues,
            batch_size,
            pool_limit,
        }
    }

    /// One production step. Skips when too many blocks are still pending or
    /// when a full batch is not available yet.
    pub fn produce(&self) -> Option<BlockId> {
        let pending = self.stores.pending.len();
        if pending > self.pool_limit {
            trace!(pending, limit = self.pool_limit, "pending pool full, not producing");
            return None;
        }
        let txns = self.pool.take_batch(self.batch_size)?;
        let id = self.ids.next();
        let base_id = self.last.swap(id, Ordering::Relaxed);
        let mut block = Block::new(id, base_id, txns);
        block.header.stamp_proposal();
        block.header.stamp_distribution();
        let shared = Arc::new(block.clone());
        self.stores.pending.insert(block);
        if self.queues.has_peers() {
            self.queues.push_block(shared);
        } else {
            self.stores.mark_synced(id);
        }
        debug!(block_id = id, base_id, txns = self.batch_size, "block produced");
        Some(id)
    }
}
