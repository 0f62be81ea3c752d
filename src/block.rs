use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

use crate::threshold::{Hash, SigShare, Signature};
use crate::txn::Transaction;

pub type BlockId = u64;
pub type ServerId = u64;
pub type ClientId = u64;

/// Block ids are `server_id * ID_STRIDE + seq`, so servers never collide.
pub const ID_STRIDE: u64 = 1_000_000;

pub fn timestamp() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

// Latency markers are write-once.
fn stamp(slot: &mut Option<u64>) {
    slot.get_or_insert_with(timestamp);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub id: BlockId,
    pub base_id: BlockId,
    pub proposal_timestamp: Option<u64>,
    pub distribution_timestamp: Option<u64>,
    pub commit_timestamp: Option<u64>,
    pub receive_timestamp: Option<u64>,
}

impl BlockHeader {
    pub fn new(id: BlockId, base_id: BlockId) -> Self {
        Self { id, base_id, ..Self::default() }
    }

    pub fn stamp_proposal(&mut self) {
        stamp(&mut self.proposal_timestamp);
    }

    pub fn stamp_distribution(&mut self) {
        stamp(&mut self.distribution_timestamp);
    }

    pub fn stamp_commit(&mut self) {
        stamp(&mut self.commit_timestamp);
    }

    pub fn stamp_receive(&mut self) {
        stamp(&mut self.receive_timestamp);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockVote {
    pub block_id: BlockId,
    pub voter_id: ClientId,
    pub signature_share: SigShare,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub votes: BTreeMap<ClientId, BlockVote>,
    pub aggregate_signature: Option<Signature>,
}

impl Block {
    pub fn new(id: BlockId, base_id: BlockId, transactions: Vec<Transaction>) -> Self {
        Self {
            header: BlockHeader::new(id, base_id),
            transactions,
            ..Self::default()
        }
    }

    pub fn id(&self) -> BlockId {
        self.header.id
    }

    /// What voters sign: ids and transactions, never timestamps or votes.
    pub fn content_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.header.id.to_be_bytes());
        hasher.update(self.header.base_id.to_be_bytes());
        hasher.update((self.transactions.len() as u64).to_be_bytes());
        for txn in &self.transactions {
            txn.add_hash(&mut hasher);
        }
        hasher.finalize().into()
    }

    // A second vote from the same voter replaces the first.
    pub fn insert_vote(&mut self, vote: BlockVote) {
        self.votes.insert(vote.voter_id, vote);
    }

    pub fn shares(&self) -> Vec<&SigShare> {
        self.votes.values().map(|v| &v.signature_share).collect()
    }

    /// Returns false if a signature was already attached.
    pub fn set_aggregate(&mut self, signature: Signature) -> bool {
        if self.aggregate_signature.is_some() {
            return false;
        }
        self.aggregate_signature = Some(signature);
        true
    }
}

/// Per-server block id counter.
#[derive(Debug)]
pub struct IdSequence {
    next: AtomicU64,
}

impl IdSequence {
    pub fn new(server_id: ServerId) -> Self {
        Self { next: AtomicU64::new(server_id * ID_STRIDE) }
    }

    pub fn next(&self) -> BlockId {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}
