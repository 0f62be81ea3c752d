//! A server: the stores, the vote path, the producer and the background
//! workers that tie them to the relay.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::account;
use crate::block::{Block, BlockHeader, BlockId, ClientId};
use crate::config::ServerConfig;
use crate::error::NodeError;
use crate::msg::{client, peer, Serialized, StatusResponse};
use crate::producer::BlockProducer;
use crate::relay::{Channel, PeerTransport, RelayQueues, Relayer};
use crate::store::Stores;
use crate::threshold::{deal, KeyShare, Threshold};
use crate::txn::{Generator, Pool, Transaction};
use crate::vote::{Disposition, Merger, VoteCollector};

// Illustrative account space for generated transfers.
const ACCOUNTS: u64 = 1 << 10;

/// What the server keeps per client.
#[derive(Debug)]
pub struct ClientProfile {
    pub id: ClientId,
    public_key: RwLock<Option<Vec<u8>>>,
    share: KeyShare,
    // Headers already handed to this client by a pull.
    seen: DashSet<BlockId>,
}

impl ClientProfile {
    fn new(share: KeyShare) -> Self {
        Self {
            id: share.index() as ClientId,
            public_key: RwLock::new(None),
            share,
            seen: DashSet::new(),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.public_key.read().is_some()
    }
}

/// Calls a client makes on a server.
pub trait ClientService: Send + Sync {
    fn register(&self, req: client::RegisterRequest) -> client::RegisterResponse;
    fn heartbeat(&self, req: client::HeartbeatRequest) -> StatusResponse;
    fn pull_pending_blocks(&self, req: client::PullPendingBlocksRequest) -> client::PullPendingBlocksResponse;
    fn get_blocks(&self, req: client::GetBlocksRequest) -> client::GetBlocksResponse;
    fn vote_blocks(&self, req: client::VoteBlocksRequest) -> StatusResponse;
    /// Human-readable summary for operators.
    fn status(&self) -> String;
}

/// Calls a peer server makes on this one.
pub trait PeerService: Send + Sync {
    fn peer_heartbeat(&self, req: peer::HeartbeatRequest) -> StatusResponse;
    fn relay_vote(&self, req: peer::RelayVoteRequest) -> StatusResponse;
    fn relay_block(&self, req: peer::RelayBlockRequest) -> StatusResponse;
    fn bcast_commit(&self, req: peer::BcastCommitRequest) -> StatusResponse;
    fn relay_block_sync(&self, req: peer::RelayBlockSyncRequest) -> StatusResponse;
}

pub struct Node {
    config: Arc<ServerConfig>,
    stores: Arc<Stores>,
    queues: Arc<RelayQueues>,
    profiles: DashMap<ClientId, ClientProfile>,
    collector: VoteCollector,
    merger: Merger,
    producer: BlockProducer,
    pool: Arc<Pool>,
    generator: Generator,
    merges: Mutex<Option<UnboundedReceiver<Block>>>,
}

impl Node {
    pub fn new(config: ServerConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let config = Arc::new(config);
        let dealt = deal(config.dkg_seed.as_bytes(), config.params())?;
        let threshold: Arc<dyn Threshold> = Arc::new(dealt.scheme);
        let stores = Arc::new(Stores::default());
        let queues = Arc::new(RelayQueues::new(config.peer_ids()));
        let pool = Arc::new(Pool::default());
        let (merge_tx, merge_rx) = unbounded_channel();

        let profiles = dealt
            .shares
            .into_iter()
            .map(|share| {
                let profile = ClientProfile::new(share);
                (profile.id, profile)
            })
            .collect();

        Ok(Self {
            collector: VoteCollector::new(
                config.server_id,
                config.server_count,
                stores.clone(),
                queues.clone(),
                threshold.clone(),
                merge_tx,
            ),
            merger: Merger::new(stores.clone(), queues.clone(), threshold),
            producer: BlockProducer::new(
                config.server_id,
                pool.clone(),
                stores.clone(),
                queues.clone(),
                config.tx_batch_size,
                config.pending_pool_limit,
            ),
            generator: Generator::new(config.server_id, ACCOUNTS),
            merges: Mutex::new(Some(merge_rx)),
            profiles,
            pool,
            queues,
            stores,
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn queues(&self) -> &RelayQueues {
        &self.queues
    }

    pub fn submit_transactions(&self, txns: Vec<Transaction>) {
        self.pool.extend(txns);
    }

    pub fn generate(&self) {
        self.pool.extend(self.generator.generate(self.config.tx_per_tick));
    }

    pub fn produce(&self) -> Option<BlockId> {
        self.producer.produce()
    }

    /// Merges whatever has reached quorum so far, without the background
    /// worker. Does nothing once `run` owns the merge queue.
    pub fn drain_merges(&self) -> usize {
        let mut merges = self.merges.lock();
        let rx = match merges.as_mut() {
            Some(rx) => rx,
            None => return 0,
        };
        let mut committed = 0;
        while let Ok(block) = rx.try_recv() {
            if self.merger.merge(block) {
                committed += 1;
            }
        }
        committed
    }

    pub fn relayer(&self, transport: Arc<dyn PeerTransport>) -> Relayer {
        Relayer::new(self.config.server_id, self.queues.clone(), self.stores.clone(), transport)
    }

    fn interval(&self) -> time::Interval {
        let mut interval = time::interval(self.config.tick());
        // Overlapping ticks are dropped, not queued.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }

    /// Runs every background worker until one fails. Only the first call
    /// gets the merge queue; later calls fail with `AlreadyRunning`.
    pub async fn run(self: Arc<Self>, transport: Arc<dyn PeerTransport>) -> Result<(), NodeError> {
        let merges = self.merges.lock().take().ok_or(NodeError::AlreadyRunning)?;
        let relayer = Arc::new(self.relayer(transport));
        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().tick_loop(Node::generate));
        tasks.spawn(self.clone().tick_loop(|node| {
            node.produce();
        }));
        tasks.spawn(self.clone().merge_loop(merges));
        for channel in Channel::ALL {
            tasks.spawn(self.clone().relay_loop(relayer.clone(), channel));
        }
        tasks.spawn(self.clone().heartbeat_loop(relayer));

        info!(server_id = self.config.server_id, "node running");
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => NodeError::Task(e.to_string()),
            };
            error!(error = %failure, "stopping node");
            tasks.abort_all();
            return Err(failure);
        }
        Ok(())
    }
}

impl Node {
    async fn tick_loop(self: Arc<Self>, step: fn(&Node)) -> Result<(), NodeError> {
        let mut interval = self.interval();
        loop {
            interval.tick().await;
            step(&self);
        }
    }

    async fn merge_loop(self: Arc<Self>, mut merges: UnboundedReceiver<Block>) -> Result<(), NodeError> {
        while let Some(block) = merges.recv().await {
            self.merger.merge(block);
        }
        Err(NodeError::Task("merge queue closed".into()))
    }

    async fn relay_loop(self: Arc<Self>, relayer: Arc<Relayer>, channel: Channel) -> Result<(), NodeError> {
        let mut interval = self.interval();
        loop {
            interval.tick().await;
            relayer.flush(channel).await?;
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, relayer: Arc<Relayer>) -> Result<(), NodeError> {
        let mut interval = self.interval();
        loop {
            interval.tick().await;
            relayer.heartbeat().await;
        }
    }
}

fn decode_all<T>(wire: &[Serialized<T>], what: &'static str) -> Vec<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    wire.iter()
        .filter_map(|item| match item.deser() {
            Ok(x) => Some(x),
            Err(e) => {
                warn!(error = %e, what, "undecodable payload skipped");
                None
            }
        })
        .collect()
}

impl ClientService for Node {
    fn status(&self) -> String {
        format!(
"This is server {}.
My peers are {:?}.
Blocks: {} pending, {} committed, {} dead.
{} transactions waiting in the pool.",
            self.config.server_id,
            self.queues.peers().collect::<Vec<_>>(),
            self.stores.pending.len(),
            self.stores.committed.len(),
            self.stores.dead_count(),
            self.pool.len(),
        )
    }

    fn register(&self, req: client::RegisterRequest) -> client::RegisterResponse {
        let refused = client::RegisterResponse {
            status: false,
            client_id: req.client_id,
            threshold_share: Vec::new(),
        };
        let profile = match self.profiles.get(&req.client_id) {
            Some(profile) => profile,
            None => {
                warn!(client_id = req.client_id, "register from unknown client");
                return refused;
            }
        };
        if !account::verify_proof(&req.public_key, req.client_id, &req.proof) {
            warn!(client_id = req.client_id, "register with bad identity proof");
            return refused;
        }
        *profile.public_key.write() = Some(req.public_key);
        info!(client_id = profile.id, "client registered");
        client::RegisterResponse {
            status: true,
            client_id: profile.id,
            threshold_share: profile.share.to_bytes().to_vec(),
        }
    }

    fn heartbeat(&self, req: client::HeartbeatRequest) -> StatusResponse {
        match self.profiles.get(&req.client_id) {
            Some(profile) if profile.is_registered() => {
                trace!(client_id = req.client_id, "client heartbeat");
                StatusResponse::ok()
            }
            _ => StatusResponse::failed(),
        }
    }

    fn pull_pending_blocks(&self, req: client::PullPendingBlocksRequest) -> client::PullPendingBlocksResponse {
        let profile = match self.profiles.get(&req.client_id) {
            Some(profile) => profile,
            None => return client::PullPendingBlocksResponse { status: false, headers: Vec::new() },
        };
        let fresh: Vec<BlockHeader> = {
            let scan = self.stores.pending.scan();
            scan.headers()
                .filter(|h| !self.config.block_sync || self.stores.is_synced(h.id))
                .filter(|h| !self.stores.is_dead(h.id))
                .filter(|h| profile.seen.insert(h.id))
                .collect()
        };
        let headers = match fresh.iter().map(Serialized::new).collect::<Result<Vec<_>, _>>() {
            Ok(headers) => headers,
            Err(e) => {
                error!(client_id = req.client_id, error = %e, "encoding headers failed");
                for header in &fresh {
                    profile.seen.remove(&header.id);
                }
                return client::PullPendingBlocksResponse { status: false, headers: Vec::new() };
            }
        };
        if !headers.is_empty() {
            debug!(client_id = req.client_id, count = headers.len(), "headers pulled");
        }
        client::PullPendingBlocksResponse { status: true, headers }
    }

    fn get_blocks(&self, req: client::GetBlocksRequest) -> client::GetBlocksResponse {
        let mut blocks = Vec::with_capacity(req.headers.len());
        for header in decode_all(&req.headers, "header") {
            // Pending only; a settled block is no longer worth a vote.
            let block = match self.stores.pending.get(header.id) {
                Some(block) => Serialized::new(&*block),
                None => {
                    debug!(client_id = req.client_id, block_id = header.id, "requested block no longer pending");
                    continue;
                }
            };
            match block {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    error!(block_id = header.id, error = %e, "encoding block failed");
                    return client::GetBlocksResponse { status: false, blocks: Vec::new() };
                }
            }
        }
        client::GetBlocksResponse { status: true, blocks }
    }

    fn vote_blocks(&self, req: client::VoteBlocksRequest) -> StatusResponse {
        if !self.profiles.contains_key(&req.client_id) {
            warn!(client_id = req.client_id, "votes from unknown client");
            return StatusResponse::failed();
        }
        for block in decode_all(&req.blocks, "block") {
            let vote = match block.votes.get(&req.client_id) {
                Some(vote) if vote.block_id == block.id() && vote.voter_id == req.client_id => vote.clone(),
                _ => {
                    warn!(client_id = req.client_id, block_id = block.id(), "block carries no vote from its sender");
                    continue;
                }
            };
            let disposition = self.collector.submit(vote);
            trace!(client_id = req.client_id, block_id = block.id(), ?disposition, "vote handled");
        }
        StatusResponse::ok()
    }
}

impl PeerService for Node {
    fn peer_heartbeat(&self, req: peer::HeartbeatRequest) -> StatusResponse {
        trace!(peer = req.peer_id, "peer heartbeat");
        StatusResponse::ok()
    }

    fn relay_vote(&self, req: peer::RelayVoteRequest) -> StatusResponse {
        let votes = decode_all(&req.votes, "vote");
        let mut quorums = 0;
        for vote in votes {
            if self.collector.accept_relayed(vote) == Disposition::Quorum {
                quorums += 1;
            }
        }
        debug!(peer = req.peer_id, count = req.votes.len(), quorums, "relayed votes");
        StatusResponse::ok()
    }

    fn relay_block(&self, req: peer::RelayBlockRequest) -> StatusResponse {
        let mut admitted = 0;
        for block in decode_all(&req.blocks, "block") {
            if self.stores.admit(block) {
                admitted += 1;
            }
        }
        debug!(peer = req.peer_id, count = req.blocks.len(), admitted, "relayed blocks");
        StatusResponse::ok()
    }

    fn bcast_commit(&self, req: peer::BcastCommitRequest) -> StatusResponse {
        for block in decode_all(&req.blocks, "block") {
            let id = block.id();
            if self.stores.commit(block) {
                debug!(peer = req.peer_id, block_id = id, "commit received");
            }
        }
        StatusResponse::ok()
    }

    fn relay_block_sync(&self, req: peer::RelayBlockSyncRequest) -> StatusResponse {
        for id in &req.block_ids {
            self.stores.mark_synced(*id);
        }
        trace!(peer = req.peer_id, count = req.block_ids.len(), "sync signals");
        StatusResponse::ok()
    }
}
