//! The voting client: pull headers, fetch bodies, sign and vote.

use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::account;
use crate::block::{Block, BlockHeader, BlockId, BlockVote, ClientId};
use crate::config::ClientConfig;
use crate::error::{ClientError, RpcError};
use crate::msg::{client, Serialized, StatusResponse};
use crate::threshold::{KeyShare, Params};

/// The calls a client makes, whatever carries them.
#[async_trait]
pub trait ServerApi: Send + Sync {
    fn name(&self) -> &str;
    async fn register(&self, req: client::RegisterRequest) -> Result<client::RegisterResponse, RpcError>;
    async fn heartbeat(&self, req: client::HeartbeatRequest) -> Result<StatusResponse, RpcError>;
    async fn pull_pending_blocks(
        &self,
        req: client::PullPendingBlocksRequest,
    ) -> Result<client::PullPendingBlocksResponse, RpcError>;
    async fn get_blocks(&self, req: client::GetBlocksRequest) -> Result<client::GetBlocksResponse, RpcError>;
    async fn vote_blocks(&self, req: client::VoteBlocksRequest) -> Result<StatusResponse, RpcError>;
}

// Skips a tick while the previous one of the same kind is still running.
struct Busy<'a>(&'a AtomicBool);

impl<'a> Busy<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Busy(flag))
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Client {
    id: ClientId,
    params: Params,
    tick: Duration,
    identity: account::Keypair,
    servers: Vec<Arc<dyn ServerApi>>,
    share: RwLock<Option<KeyShare>>,
    seen: DashSet<BlockId>,
    // Pulled but not fetched yet, with the index of the server that revealed it.
    headers: DashMap<BlockId, (usize, BlockHeader)>,
    queue: Mutex<VecDeque<Block>>,
    // Headers are deduplicated by `seen`, so a count is all that is kept.
    voted: AtomicUsize,
    pulling: AtomicBool,
    fetching: AtomicBool,
    voting: AtomicBool,
}

impl Client {
    pub fn new(config: &ClientConfig, servers: Vec<Arc<dyn ServerApi>>) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            id: config.client_id,
            params: config.params(),
            tick: config.tick(),
            identity: account::Keypair::gen(),
            servers,
            share: RwLock::new(None),
            seen: DashSet::new(),
            headers: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            voted: AtomicUsize::new(0),
            pulling: AtomicBool::new(false),
            fetching: AtomicBool::new(false),
            voting: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn voted(&self) -> usize {
        self.voted.load(Ordering::Relaxed)
    }

    /// Registers with every server. Every server deals the same share, so
    /// the first one handed out is kept.
    pub async fn register(&self) -> Result<(), ClientError> {
        let mut accepted = 0;
        for server in &self.servers {
            let req = client::RegisterRequest {
                client_id: self.id,
                public_key: self.identity.public_bytes(),
                proof: self.identity.prove(self.id),
            };
            match server.register(req).await {
                Ok(resp) if resp.status => {
                    accepted += 1;
                    if self.share.read().is_none() {
                        let share = KeyShare::from_bytes(self.id as u32, self.params, &resp.threshold_share)?;
                        *self.share.write() = Some(share);
                    }
                }
                Ok(_) => warn!(client_id = self.id, server = server.name(), "registration refused"),
                Err(e) => warn!(client_id = self.id, server = server.name(), error = %e, "registration failed"),
            }
        }
        if accepted == 0 {
            return Err(ClientError::NotRegistered);
        }
        info!(client_id = self.id, servers = accepted, "registered");
        Ok(())
    }

    pub async fn heartbeat(&self) -> usize {
        let mut alive = 0;
        for server in &self.servers {
            match server.heartbeat(client::HeartbeatRequest { client_id: self.id }).await {
                Ok(resp) if resp.status => alive += 1,
                Ok(_) => warn!(client_id = self.id, server = server.name(), "heartbeat refused"),
                Err(e) => warn!(client_id = self.id, server = server.name(), error = %e, "heartbeat failed"),
            }
        }
        alive
    }

    /// Records headers this client has not seen from any server yet.
    pub async fn pull_headers(&self) -> usize {
        let _busy = match Busy::enter(&self.pulling) {
            Some(busy) => busy,
            None => return 0,
        };
        let mut fresh = 0;
        for (index, server) in self.servers.iter().enumerate() {
            let resp = match server.pull_pending_blocks(client::PullPendingBlocksRequest { client_id: self.id }).await {
                Ok(resp) if resp.status => resp,
                Ok(_) => {
                    warn!(client_id = self.id, server = server.name(), "pull refused");
                    continue;
                }
                Err(e) => {
                    warn!(client_id = self.id, server = server.name(), error = %e, "pull failed");
                    continue;
                }
            };
            for wire in &resp.headers {
                match wire.deser() {
                    Ok(header) => {
                        if self.seen.insert(header.id) {
                            self.headers.insert(header.id, (index, header));
                            fresh += 1;
                        }
                    }
                    Err(e) => warn!(client_id = self.id, error = %e, "undecodable header"),
                }
            }
        }
        if fresh > 0 {
            debug!(client_id = self.id, fresh, "headers pulled");
        }
        fresh
    }

    /// Fetches every pulled header's body from the server that revealed it.
    pub async fn fetch_bodies(&self) -> usize {
        let _busy = match Busy::enter(&self.fetching) {
            Some(busy) => busy,
            None => return 0,
        };
        let mut by_server: BTreeMap<usize, Vec<BlockHeader>> = BTreeMap::new();
        for entry in self.headers.iter() {
            let (index, header) = entry.value();
            by_server.entry(*index).or_default().push(header.clone());
        }
        let mut fetched = 0;
        for (index, headers) in by_server {
            let server = match self.servers.get(index) {
                Some(server) => server,
                None => continue,
            };
            let wire = match headers.iter().map(Serialized::new).collect::<Result<Vec<_>, _>>() {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(client_id = self.id, error = %e, "encoding headers failed");
                    continue;
                }
            };
            let resp = match server.get_blocks(client::GetBlocksRequest { client_id: self.id, headers: wire }).await {
                Ok(resp) if resp.status => resp,
                Ok(_) => {
                    warn!(client_id = self.id, server = server.name(), "fetch refused");
                    continue;
                }
                Err(e) => {
                    warn!(client_id = self.id, server = server.name(), error = %e, "fetch failed");
                    continue;
                }
            };
            // Headers the server no longer holds are settled; drop them too.
            for header in &headers {
                self.headers.remove(&header.id);
            }
            let mut queue = self.queue.lock();
            for wire in &resp.blocks {
                match wire.deser() {
                    Ok(block) => {
                        queue.push_back(block);
                        fetched += 1;
                    }
                    Err(e) => warn!(client_id = self.id, error = %e, "undecodable block"),
                }
            }
        }
        if fetched > 0 {
            debug!(client_id = self.id, fetched, "bodies fetched");
        }
        fetched
    }

    /// Signs every queued block and submits the batch to all servers. The
    /// batch goes back on the queue only if no server took it.
    pub async fn vote(&self) -> usize {
        let _busy = match Busy::enter(&self.voting) {
            Some(busy) => busy,
            None => return 0,
        };
        let share = match self.share.read().clone() {
            Some(share) => share,
            None => {
                debug!(client_id = self.id, "not registered yet, holding votes");
                return 0;
            }
        };
        let mut blocks: Vec<Block> = mem::take(&mut *self.queue.lock()).into();
        if blocks.is_empty() {
            return 0;
        }
        for block in &mut blocks {
            let signature_share = share.sign(&block.content_hash());
            block.insert_vote(BlockVote { block_id: block.id(), voter_id: self.id, signature_share });
        }
        let wire = match blocks.iter().map(Serialized::new).collect::<Result<Vec<_>, _>>() {
            Ok(wire) => wire,
            Err(e) => {
                warn!(client_id = self.id, error = %e, "encoding votes failed");
                self.queue.lock().extend(blocks);
                return 0;
            }
        };
        let mut accepted = 0;
        for server in &self.servers {
            let req = client::VoteBlocksRequest { client_id: self.id, blocks: wire.clone() };
            match server.vote_blocks(req).await {
                Ok(resp) if resp.status => accepted += 1,
                Ok(_) => warn!(client_id = self.id, server = server.name(), "votes refused"),
                Err(e) => warn!(client_id = self.id, server = server.name(), error = %e, "voting failed"),
            }
        }
        if accepted == 0 {
            self.queue.lock().extend(blocks);
            return 0;
        }
        self.voted.fetch_add(blocks.len(), Ordering::Relaxed);
        trace!(client_id = self.id, count = blocks.len(), servers = accepted, "voted");
        blocks.len()
    }

    fn interval(&self) -> time::Interval {
        let mut interval = time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }

    async fn pull_loop(self: Arc<Self>) {
        let mut interval = self.interval();
        loop {
            interval.tick().await;
            self.pull_headers().await;
        }
    }

    async fn fetch_loop(self: Arc<Self>) {
        let mut interval = self.interval();
        loop {
            interval.tick().await;
            self.fetch_bodies().await;
        }
    }

    async fn vote_loop(self: Arc<Self>) {
        let mut interval = self.interval();
        loop {
            interval.tick().await;
            self.vote().await;
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = self.interval();
        loop {
            interval.tick().await;
            self.heartbeat().await;
        }
    }

    /// Registers, then runs the pull, fetch, vote and heartbeat cycles.
    pub async fn run(self: Arc<Self>) -> Result<(), ClientError> {
        self.register().await?;
        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().pull_loop());
        tasks.spawn(self.clone().fetch_loop());
        tasks.spawn(self.clone().vote_loop());
        tasks.spawn(self.clone().heartbeat_loop());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tasks.abort_all();
                return Err(ClientError::Task(e.to_string()));
            }
        }
        Ok(())
    }
}
