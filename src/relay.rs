//! Server-to-server relay.
//!
//! Every peer gets one unbounded outbox per channel. Producers append and never
//! block; a periodic sender per channel swaps each outbox out whole and ships it
//! to the peer as one batched call. Any failed relay call is fatal to the node.

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::block::{Block, BlockId, BlockVote, ServerId};
use crate::error::{NodeError, RpcError};
use crate::msg::{peer, Serialized, StatusResponse};
use crate::store::Stores;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Votes,
    Blocks,
    Commits,
    Sync,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Votes, Channel::Blocks, Channel::Commits, Channel::Sync];
}

#[derive(Debug, Default)]
struct Outbox {
    votes: Mutex<Vec<BlockVote>>,
    blocks: Mutex<Vec<Arc<Block>>>,
    commits: Mutex<Vec<Arc<Block>>>,
    sync: Mutex<Vec<BlockId>>,
}

impl Outbox {
    fn len(&self, channel: Channel) -> usize {
        match channel {
            Channel::Votes => self.votes.lock().len(),
            Channel::Blocks => self.blocks.lock().len(),
            Channel::Commits => self.commits.lock().len(),
            Channel::Sync => self.sync.lock().len(),
        }
    }
}

/// Outbound queues for every peer, keyed by peer id. The peer set is fixed.
#[derive(Debug)]
pub struct RelayQueues {
    outboxes: BTreeMap<ServerId, Outbox>,
    // Peers a new block still has to reach before its sync signal goes out.
    undelivered: DashMap<BlockId, usize>,
}

impl RelayQueues {
    pub fn new(peers: impl IntoIterator<Item = ServerId>) -> Self {
        Self {
            outboxes: peers.into_iter().map(|p| (p, Outbox::default())).collect(),
            undelivered: DashMap::new(),
        }
    }

    pub fn peers(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.outboxes.keys().copied()
    }

    pub fn has_peers(&self) -> bool {
        !self.outboxes.is_empty()
    }

    pub fn queued(&self, peer: ServerId, channel: Channel) -> usize {
        self.outboxes.get(&peer).map_or(0, |o| o.len(channel))
    }

    pub fn push_vote(&self, peer: ServerId, vote: BlockVote) {
        match self.outboxes.get(&peer) {
            Some(outbox) => outbox.votes.lock().push(vote),
            None => warn!(peer, block_id = vote.block_id, "vote for unknown peer dropped"),
        }
    }

    /// Queues a freshly produced block for every peer.
    pub fn push_block(&self, block: Arc<Block>) {
        if !self.has_peers() {
            return;
        }
        self.undelivered.insert(block.id(), self.outboxes.len());
        for outbox in self.outboxes.values() {
            outbox.blocks.lock().push(block.clone());
        }
    }

    pub fn push_commit(&self, block: Arc<Block>) {
        for outbox in self.outboxes.values() {
            outbox.commits.lock().push(block.clone());
        }
    }

    fn push_sync(&self, id: BlockId) {
        for outbox in self.outboxes.values() {
            outbox.sync.lock().push(id);
        }
    }

    /// Records delivery of a block to one peer. Returns true when that was the
    /// last peer outstanding.
    fn delivered(&self, id: BlockId) -> bool {
        let remaining = match self.undelivered.get_mut(&id) {
            Some(mut left) => {
                *left = left.saturating_sub(1);
                *left
            }
            None => return false,
        };
        if remaining == 0 {
            self.undelivered.remove(&id);
            return true;
        }
        false
    }
}

/// Outbound peer calls.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn heartbeat(&self, peer: ServerId, req: peer::HeartbeatRequest) -> Result<StatusResponse, RpcError>;
    async fn relay_votes(&self, peer: ServerId, req: peer::RelayVoteRequest) -> Result<StatusResponse, RpcError>;
    async fn relay_blocks(&self, peer: ServerId, req: peer::RelayBlockRequest) -> Result<StatusResponse, RpcError>;
    async fn bcast_commits(&self, peer: ServerId, req: peer::BcastCommitRequest) -> Result<StatusResponse, RpcError>;
    async fn relay_sync(&self, peer: ServerId, req: peer::RelayBlockSyncRequest) -> Result<StatusResponse, RpcError>;
}

fn checked(resp: Result<StatusResponse, RpcError>, call: &'static str) -> Result<(), RpcError> {
    if resp?.status {
        Ok(())
    } else {
        Err(RpcError::Status(call))
    }
}

fn wire_blocks(blocks: &[Arc<Block>]) -> Result<Vec<Serialized<Block>>, RpcError> {
    blocks
        .iter()
        .map(|b| Serialized::new(b.as_ref()).map_err(RpcError::from))
        .collect()
}

/// Drains outboxes through a transport.
pub struct Relayer {
    server_id: ServerId,
    queues: Arc<RelayQueues>,
    stores: Arc<Stores>,
    transport: Arc<dyn PeerTransport>,
}

impl Relayer {
    pub fn new(
        server_id: ServerId,
        queues: Arc<RelayQueues>,
        stores: Arc<Stores>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self { server_id, queues, stores, transport }
    }

    /// Ships every peer's outbox for `channel`. Returns the number of items sent.
    pub async fn flush(&self, channel: Channel) -> Result<usize, NodeError> {
        let mut sent = 0;
        for peer in self.queues.peers().collect::<Vec<_>>() {
            sent += self.flush_to(peer, channel).await?;
        }
        Ok(sent)
    }

    /// Ships one peer's outbox for `channel`.
    pub async fn flush_to(&self, peer: ServerId, channel: Channel) -> Result<usize, NodeError> {
        self.flush_peer(peer, channel)
            .await
            .map_err(|source| NodeError::Relay { peer, channel, source })
    }

    async fn flush_peer(&self, peer: ServerId, channel: Channel) -> Result<usize, RpcError> {
        let outbox = match self.queues.outboxes.get(&peer) {
            Some(outbox) => outbox,
            None => return Ok(0),
        };
        let peer_id = self.server_id;
        let sent = match channel {
            Channel::Votes => {
                let votes = mem::take(&mut *outbox.votes.lock());
                if votes.is_empty() {
                    return Ok(0);
                }
                let count = votes.len();
                let votes = votes
                    .iter()
                    .map(Serialized::new)
                    .collect::<Result<Vec<_>, _>>()?;
                checked(
                    self.transport.relay_votes(peer, peer::RelayVoteRequest { peer_id, votes }).await,
                    "RelayVote",
                )?;
                count
            }
            Channel::Blocks => {
                let blocks = mem::take(&mut *outbox.blocks.lock());
                if blocks.is_empty() {
                    return Ok(0);
                }
                let ids: Vec<BlockId> = blocks.iter().map(|b| b.id()).collect();
                let wire = wire_blocks(&blocks)?;
                checked(
                    self.transport.relay_blocks(peer, peer::RelayBlockRequest { peer_id, blocks: wire }).await,
                    "RelayBlock",
                )?;
                // Nobody reveals the header until every peer, owners included, has the body.
                for id in &ids {
                    if self.queues.delivered(*id) {
                        trace!(block_id = *id, "block reached every peer");
                        self.queues.push_sync(*id);
                        self.stores.mark_synced(*id);
                    }
                }
                ids.len()
            }
            Channel::Commits => {
                let blocks = mem::take(&mut *outbox.commits.lock());
                if blocks.is_empty() {
                    return Ok(0);
                }
                let wire = wire_blocks(&blocks)?;
                checked(
                    self.transport.bcast_commits(peer, peer::BcastCommitRequest { peer_id, blocks: wire }).await,
                    "SPBcastCommit",
                )?;
                blocks.len()
            }
            Channel::Sync => {
                let block_ids = mem::take(&mut *outbox.sync.lock());
                if block_ids.is_empty() {
                    return Ok(0);
                }
                let count = block_ids.len();
                checked(
                    self.transport.relay_sync(peer, peer::RelayBlockSyncRequest { peer_id, block_ids }).await,
                    "RelayBlockSync",
                )?;
                count
            }
        };
        debug!(peer, ?channel, sent, "relayed");
        Ok(sent)
    }

    /// Liveness only: an unreachable peer is logged, not fatal.
    pub async fn heartbeat(&self) -> usize {
        let mut alive = 0;
        for peer in self.queues.peers().collect::<Vec<_>>() {
            let resp = self
                .transport
                .heartbeat(peer, peer::HeartbeatRequest { peer_id: self.server_id })
                .await;
            match checked(resp, "SPHeartbeat") {
                Ok(()) => {
                    trace!(peer, "peer alive");
                    alive += 1;
                }
                Err(e) => warn!(peer, error = %e, "peer heartbeat failed"),
            }
        }
        alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::tests::sample;
    use crate::threshold::SigShare;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(ServerId, &'static str, usize)>>,
        fail: bool,
    }

    impl Recorder {
        fn record(&self, peer: ServerId, call: &'static str, n: usize) -> Result<StatusResponse, RpcError> {
            self.calls.lock().push((peer, call, n));
            if self.fail {
                Err(RpcError::Transport("connection refused".into()))
            } else {
                Ok(StatusResponse::ok())
            }
        }
    }

    #[async_trait]
    impl PeerTransport for Recorder {
        async fn heartbeat(&self, peer: ServerId, _: peer::HeartbeatRequest) -> Result<StatusResponse, RpcError> {
            self.record(peer, "heartbeat", 0)
        }
        async fn relay_votes(&self, peer: ServerId, req: peer::RelayVoteRequest) -> Result<StatusResponse, RpcError> {
            self.record(peer, "votes", req.votes.len())
        }
        async fn relay_blocks(&self, peer: ServerId, req: peer::RelayBlockRequest) -> Result<StatusResponse, RpcError> {
            self.record(peer, "blocks", req.blocks.len())
        }
        async fn bcast_commits(&self, peer: ServerId, req: peer::BcastCommitRequest) -> Result<StatusResponse, RpcError> {
            self.record(peer, "commits", req.blocks.len())
        }
        async fn relay_sync(&self, peer: ServerId, req: peer::RelayBlockSyncRequest) -> Result<StatusResponse, RpcError> {
            self.record(peer, "sync", req.block_ids.len())
        }
    }

    fn setup(fail: bool) -> (Arc<RelayQueues>, Arc<Stores>, Arc<Recorder>, Relayer) {
        let queues = Arc::new(RelayQueues::new([2, 3]));
        let stores = Arc::new(Stores::default());
        let recorder = Arc::new(Recorder { fail, ..Recorder::default() });
        let relayer = Relayer::new(1, queues.clone(), stores.clone(), recorder.clone());
        (queues, stores, recorder, relayer)
    }

    #[tokio::test]
    async fn empty_outbox_sends_nothing() {
        let (_, _, recorder, relayer) = setup(false);
        for channel in Channel::ALL {
            assert_eq!(relayer.flush(channel).await.unwrap(), 0);
        }
        assert!(recorder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn batches_per_peer() {
        let (queues, _, recorder, relayer) = setup(false);
        for voter in 1..=3 {
            queues.push_vote(3, BlockVote {
                block_id: 4,
                voter_id: voter,
                signature_share: SigShare { signer_index: voter as u32, t: 3, n: 3, sig: vec![1; 96] },
            });
        }
        assert_eq!(queues.queued(3, Channel::Votes), 3);
        assert_eq!(relayer.flush(Channel::Votes).await.unwrap(), 3);
        assert_eq!(*recorder.calls.lock(), vec![(3, "votes", 3)]);
        assert_eq!(queues.queued(3, Channel::Votes), 0);
    }

    #[tokio::test]
    async fn sync_follows_full_delivery() {
        let (queues, stores, recorder, relayer) = setup(false);
        queues.push_block(Arc::new(sample(1_000_001, 2)));
        assert_eq!(queues.queued(2, Channel::Blocks), 1);
        assert_eq!(relayer.flush(Channel::Blocks).await.unwrap(), 2);
        assert!(stores.is_synced(1_000_001));
        assert_eq!(queues.queued(2, Channel::Sync), 1);
        assert_eq!(queues.queued(3, Channel::Sync), 1);
        assert_eq!(relayer.flush(Channel::Sync).await.unwrap(), 2);
        let calls = recorder.calls.lock().clone();
        assert_eq!(calls, vec![(2, "blocks", 1), (3, "blocks", 1), (2, "sync", 1), (3, "sync", 1)]);
    }

    #[tokio::test]
    async fn sync_waits_for_the_owners() {
        let queues = Arc::new(RelayQueues::new([2, 3, 4]));
        let stores = Arc::new(Stores::default());
        let recorder = Arc::new(Recorder::default());
        let relayer = Relayer::new(1, queues.clone(), stores.clone(), recorder.clone());
        // owned by {3, 4} among four servers
        queues.push_block(Arc::new(sample(1_000_002, 1)));

        assert_eq!(relayer.flush_to(2, Channel::Blocks).await.unwrap(), 1);
        for peer in [2, 3, 4] {
            assert_eq!(queues.queued(peer, Channel::Sync), 0);
        }
        assert_eq!(relayer.flush(Channel::Sync).await.unwrap(), 0);
        assert!(!stores.is_synced(1_000_002));

        assert_eq!(relayer.flush_to(3, Channel::Blocks).await.unwrap(), 1);
        assert_eq!(queues.queued(2, Channel::Sync), 0);
        assert_eq!(relayer.flush_to(4, Channel::Blocks).await.unwrap(), 1);
        assert!(stores.is_synced(1_000_002));
        for peer in [2, 3, 4] {
            assert_eq!(queues.queued(peer, Channel::Sync), 1);
        }
        assert_eq!(relayer.flush(Channel::Sync).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failure_is_fatal() {
        let (queues, _, _, relayer) = setup(true);
        queues.push_commit(Arc::new(sample(1_000_001, 0)));
        match relayer.flush(Channel::Commits).await {
            Err(NodeError::Relay { peer: 2, channel: Channel::Commits, .. }) => {}
            other => panic!("expected relay failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn heartbeat_tolerates_down_peers() {
        let (_, _, _, relayer) = setup(true);
        assert_eq!(relayer.heartbeat().await, 0);
        let (_, _, recorder, relayer) = setup(false);
        assert_eq!(relayer.heartbeat().await, 2);
        assert_eq!(recorder.calls.lock().len(), 2);
    }
}
