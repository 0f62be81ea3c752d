use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

use crate::block::{ServerId, ID_STRIDE};

pub type Address = u64;

// Opaque payload. Balances are illustrative only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: u64,
    pub sender: Address,
    pub receiver: Address,
    pub value: u64,
    pub fee: u64,
}

impl Transaction {
    pub fn add_hash(&self, hasher: &mut Sha256) {
        hasher.update(self.id.to_be_bytes());
        hasher.update(self.sender.to_be_bytes());
        hasher.update(self.receiver.to_be_bytes());
        hasher.update(self.value.to_be_bytes());
        hasher.update(self.fee.to_be_bytes());
    }
}

/// FIFO of transactions waiting to be packed. Each transaction leaves the pool
/// exactly once, inside a block.
#[derive(Debug, Default)]
pub struct Pool {
    txns: Mutex<VecDeque<Transaction>>,
}

impl Pool {
    pub fn extend(&self, txns: impl IntoIterator<Item = Transaction>) {
        self.txns.lock().extend(txns);
    }

    pub fn len(&self) -> usize {
        self.txns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // No partial batches: either `size` transactions come out or none do.
    pub fn take_batch(&self, size: usize) -> Option<Vec<Transaction>> {
        let mut txns = self.txns.lock();
        if size == 0 || txns.len() < size {
            return None;
        }
        Some(txns.drain(..size).collect())
    }
}

/// Stand-in for an external submitter.
#[derive(Debug)]
pub struct Generator {
    next_id: AtomicU64,
    accounts: u64,
}

impl Generator {
    pub fn new(server_id: ServerId, accounts: u64) -> Self {
        Self {
            next_id: AtomicU64::new(server_id * ID_STRIDE),
            accounts: accounts.max(2),
        }
    }

    pub fn generate(&self, count: usize) -> Vec<Transaction> {
        let mut rng = rand::thread_rng();
        (0..count)
            .map(|_| {
                let sender = rng.gen::<u64>() % self.accounts;
                let receiver = (sender + 1 + rng.gen::<u64>() % (self.accounts - 1)) % self.accounts;
                Transaction {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
                    sender,
                    receiver,
                    value: 1 + rng.gen::<u64>() % 1_000,
                    fee: rng.gen::<u64>() % 10,
                }
            })
            .collect()
    }
}
