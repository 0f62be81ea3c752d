use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, trace, warn};

use crate::block::{Block, BlockVote, ServerId};
use crate::pending::{owning_servers, Role, VoteOutcome};
use crate::relay::RelayQueues;
use crate::store::Stores;
use crate::threshold::Threshold;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Block is dead; vote ignored.
    Dead,
    /// Not an owner here; vote queued for the owning servers only.
    Forwarded,
    /// No such pending block (not produced yet, or already settled).
    Unknown,
    Recorded,
    /// This vote completed the quorum and the block went to the merge queue.
    Quorum,
}

/// Routes votes to their owners and applies them to locally owned blocks.
pub struct VoteCollector {
    server_id: ServerId,
    server_count: u64,
    stores: Arc<Stores>,
    queues: Arc<RelayQueues>,
    threshold: Arc<dyn Threshold>,
    merges: UnboundedSender<Block>,
}

impl VoteCollector {
    pub fn new(
        server_id: ServerId,
        server_count: u64,
        stores: Arc<Stores>,
        queues: Arc<RelayQueues>,
        threshold: Arc<dyn Threshold>,
        merges: UnboundedSender<Block>,
    ) -> Self {
        Self { server_id, server_count, stores, queues, threshold, merges }
    }

    /// A vote straight from a client.
    pub fn submit(&self, vote: BlockVote) -> Disposition {
        if self.stores.is_dead(vote.block_id) {
            warn!(block_id = vote.block_id, voter = vote.voter_id, "vote for dead block skipped");
            return Disposition::Dead;
        }
        let owners = owning_servers(vote.block_id, self.server_count);
        match owners.role(self.server_id) {
            None => {
                for owner in owners.members() {
                    self.queues.push_vote(owner, vote.clone());
                }
                trace!(block_id = vote.block_id, primary = owners.primary, shadow = owners.shadow, "vote forwarded");
                Disposition::Forwarded
            }
            Some(Role::Shadow) => {
                self.queues.push_vote(owners.primary, vote.clone());
                self.apply(vote)
            }
            Some(Role::Primary) => self.apply(vote),
        }
    }

    /// A vote relayed by a peer. Relayed votes are never forwarded again.
    pub fn accept_relayed(&self, vote: BlockVote) -> Disposition {
        if self.stores.is_dead(vote.block_id) {
            debug!(block_id = vote.block_id, "relayed vote for dead block skipped");
            return Disposition::Dead;
        }
        self.apply(vote)
    }

    fn apply(&self, vote: BlockVote) -> Disposition {
        let (block_id, voter) = (vote.block_id, vote.voter_id);
        let quorum = self.threshold.params().t as usize;
        match self.stores.pending.apply_vote(vote, quorum) {
            VoteOutcome::Unknown => {
                debug!(block_id, voter, "vote for unknown block skipped");
                Disposition::Unknown
            }
            VoteOutcome::Recorded { votes } => {
                trace!(block_id, voter, votes, "vote recorded");
                Disposition::Recorded
            }
            VoteOutcome::Quorum(block) => {
                debug!(block_id, "quorum reached");
                if self.merges.send(block).is_err() {
                    error!(block_id, "merge queue closed, block lost");
                }
                Disposition::Quorum
            }
        }
    }
}

/// Turns quorate blocks into committed ones.
pub struct Merger {
    stores: Arc<Stores>,
    queues: Arc<RelayQueues>,
    threshold: Arc<dyn Threshold>,
}

impl Merger {
    pub fn new(stores: Arc<Stores>, queues: Arc<RelayQueues>, threshold: Arc<dyn Threshold>) -> Self {
        Self { stores, queues, threshold }
    }

    /// Returns whether the block was newly committed here.
    pub fn merge(&self, mut block: Block) -> bool {
        let id = block.id();
        let hash = block.content_hash();
        let signature = match self.threshold.merge(&hash, &block.shares()) {
            Ok(signature) => signature,
            Err(e) => {
                error!(block_id = id, error = %e, "merge failed, marking block dead");
                self.stores.mark_dead(id);
                return false;
            }
        };
        if !block.set_aggregate(signature) {
            warn!(block_id = id, "block already carried a signature");
        }
        block.header.stamp_commit();
        block.header.stamp_receive();
        let shared = Arc::new(block.clone());
        if !self.stores.commit(block) {
            debug!(block_id = id, "already committed");
            return false;
        }
        self.queues.push_commit(shared);
        info!(block_id = id, "block committed");
        true
    }
}
