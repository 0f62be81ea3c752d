//! In-process transports: a whole cluster inside one test, with every
//! request still passing through the wire codec.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::block::ServerId;
use crate::client::ServerApi;
use crate::config::ServerConfig;
use crate::error::RpcError;
use crate::msg::{client, decode, encode, peer, StatusResponse};
use crate::node::{ClientService, Node, PeerService};
use crate::relay::{Channel, PeerTransport};

fn wire<T: Serialize + DeserializeOwned>(x: &T) -> Result<T, RpcError> {
    Ok(decode(&encode(x)?)?)
}

#[derive(Default)]
pub struct LocalNetwork {
    servers: DashMap<ServerId, Arc<dyn PeerService>>,
    down: DashSet<ServerId>,
}

impl LocalNetwork {
    pub fn join(&self, id: ServerId, server: Arc<dyn PeerService>) {
        self.servers.insert(id, server);
    }

    pub fn take_down(&self, id: ServerId) {
        self.down.insert(id);
    }

    fn route(&self, peer: ServerId) -> Result<Arc<dyn PeerService>, RpcError> {
        if self.down.contains(&peer) {
            return Err(RpcError::Transport(format!("server {} is down", peer)));
        }
        self.servers.get(&peer).map(|s| s.clone()).ok_or(RpcError::NoRoute(peer))
    }
}

#[async_trait]
impl PeerTransport for LocalNetwork {
    async fn heartbeat(&self, peer: ServerId, req: peer::HeartbeatRequest) -> Result<StatusResponse, RpcError> {
        wire(&self.route(peer)?.peer_heartbeat(wire(&req)?))
    }

    async fn relay_votes(&self, peer: ServerId, req: peer::RelayVoteRequest) -> Result<StatusResponse, RpcError> {
        wire(&self.route(peer)?.relay_vote(wire(&req)?))
    }

    async fn relay_blocks(&self, peer: ServerId, req: peer::RelayBlockRequest) -> Result<StatusResponse, RpcError> {
        wire(&self.route(peer)?.relay_block(wire(&req)?))
    }

    async fn bcast_commits(&self, peer: ServerId, req: peer::BcastCommitRequest) -> Result<StatusResponse, RpcError> {
        wire(&self.route(peer)?.bcast_commit(wire(&req)?))
    }

    async fn relay_sync(&self, peer: ServerId, req: peer::RelayBlockSyncRequest) -> Result<StatusResponse, RpcError> {
        wire(&self.route(peer)?.relay_block_sync(wire(&req)?))
    }
}

pub struct LocalServer {
    name: String,
    service: Arc<dyn ClientService>,
}

impl LocalServer {
    pub fn new(name: impl Into<String>, service: Arc<dyn ClientService>) -> Self {
        Self { name: name.into(), service }
    }
}

#[async_trait]
impl ServerApi for LocalServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn register(&self, req: client::RegisterRequest) -> Result<client::RegisterResponse, RpcError> {
        wire(&self.service.register(wire(&req)?))
    }

    async fn heartbeat(&self, req: client::HeartbeatRequest) -> Result<StatusResponse, RpcError> {
        wire(&self.service.heartbeat(wire(&req)?))
    }

    async fn pull_pending_blocks(
        &self,
        req: client::PullPendingBlocksRequest,
    ) -> Result<client::PullPendingBlocksResponse, RpcError> {
        wire(&self.service.pull_pending_blocks(wire(&req)?))
    }

    async fn get_blocks(&self, req: client::GetBlocksRequest) -> Result<client::GetBlocksResponse, RpcError> {
        wire(&self.service.get_blocks(wire(&req)?))
    }

    async fn vote_blocks(&self, req: client::VoteBlocksRequest) -> Result<StatusResponse, RpcError> {
        wire(&self.service.vote_blocks(wire(&req)?))
    }
}

/// Servers `1..=n` joined to one network.
pub struct Cluster {
    pub net: Arc<LocalNetwork>,
    nodes: Vec<Arc<Node>>,
}

impl Cluster {
    pub fn new(n: u64, config: impl Fn(ServerId) -> ServerConfig) -> Self {
        let net = Arc::new(LocalNetwork::default());
        let nodes: Vec<Arc<Node>> = (1..=n)
            .map(|id| Arc::new(Node::new(config(id)).unwrap()))
            .collect();
        for node in &nodes {
            net.join(node.config().server_id, node.clone());
        }
        Self { net, nodes }
    }

    pub fn node(&self, id: ServerId) -> Arc<Node> {
        self.nodes[(id - 1) as usize].clone()
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn servers(&self) -> Vec<Arc<dyn ServerApi>> {
        self.nodes
            .iter()
            .map(|node| -> Arc<dyn ServerApi> {
                Arc::new(LocalServer::new(format!("server {}", node.config().server_id), node.clone()))
            })
            .collect()
    }

    pub async fn flush(&self, channel: Channel) -> usize {
        let mut sent = 0;
        for node in &self.nodes {
            sent += node.relayer(self.net.clone()).flush(channel).await.unwrap();
        }
        sent
    }

    pub async fn flush_all(&self) -> usize {
        let mut sent = 0;
        for channel in Channel::ALL {
            sent += self.flush(channel).await;
        }
        sent
    }

    pub fn drain_merges(&self) -> usize {
        self.nodes.iter().map(|node| node.drain_merges()).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::block::BlockId;
    use crate::client::Client;
    use crate::config::ClientConfig;
    use crate::config::tests::{sized, three};
    use crate::error::NodeError;
    use crate::msg::client::{PullPendingBlocksRequest, VoteBlocksRequest};
    use crate::node::tests::{share_for, voted};
    use crate::store::Lifecycle;
    use crate::threshold::{deal, Params, Threshold};
    use crate::txn::Generator;

    fn small_batches(id: ServerId) -> ServerConfig {
        ServerConfig { tx_batch_size: 2, tick_interval_ms: 10, ..three(id) }
    }

    fn verifies(node: &Node, id: BlockId) -> bool {
        let scheme = deal(node.config().dkg_seed.as_bytes(), Params::unanimous(4)).unwrap().scheme;
        let block = node.stores().committed.get(id).unwrap();
        match &block.aggregate_signature {
            Some(sig) => scheme.verify(&block.content_hash(), sig),
            None => false,
        }
    }

    #[tokio::test]
    async fn commit_reaches_servers_that_never_held_the_block() {
        let cluster = Cluster::new(3, small_batches);
        let one = cluster.node(1);
        one.submit_transactions(Generator::new(1, 8).generate(2));
        assert_eq!(one.produce(), Some(1_000_001));
        let block = one.stores().pending.get(1_000_001).map(|b| b.clone()).unwrap();
        assert_eq!(block.transactions.len(), 2);

        for client_id in 1..=4 {
            let share = share_for(&one, client_id);
            let resp = one.vote_blocks(VoteBlocksRequest { client_id, blocks: vec![voted(&block, &share)] });
            assert!(resp.status);
        }
        assert_eq!(one.drain_merges(), 1);
        assert_eq!(one.stores().lifecycle(1_000_001), Lifecycle::Committed);
        assert!(verifies(&one, 1_000_001));

        assert_eq!(cluster.flush(Channel::Commits).await, 2);
        for id in [2, 3] {
            let node = cluster.node(id);
            assert_eq!(node.stores().lifecycle(1_000_001), Lifecycle::Committed);
            assert!(verifies(&node, 1_000_001));
        }
        // the late relays of votes and the body change nothing
        cluster.flush_all().await;
        assert_eq!(cluster.drain_merges(), 0);
        for node in cluster.nodes() {
            assert!(node.stores().pending.is_empty());
            assert_eq!(node.stores().committed.len(), 1);
        }
    }

    #[tokio::test]
    async fn clients_drive_every_block_to_commit() {
        let cluster = Cluster::new(3, small_batches);
        let mut produced = Vec::new();
        for node in cluster.nodes() {
            node.submit_transactions(Generator::new(node.config().server_id + 10, 8).generate(2));
            produced.push(node.produce().unwrap());
        }
        let clients: Vec<Client> = (1..=4)
            .map(|client_id| {
                let config = ClientConfig { client_id, client_count: 4, ..ClientConfig::default() };
                Client::new(&config, cluster.servers()).unwrap()
            })
            .collect();
        for client in &clients {
            client.register().await.unwrap();
        }

        for _ in 0..10 {
            cluster.flush_all().await;
            for client in &clients {
                client.pull_headers().await;
                client.fetch_bodies().await;
                client.vote().await;
            }
            cluster.drain_merges();
            cluster.flush_all().await;
            let done = cluster
                .nodes()
                .iter()
                .all(|node| produced.iter().all(|id| node.stores().committed.contains(*id)));
            if done {
                break;
            }
        }

        for node in cluster.nodes() {
            for id in &produced {
                assert_eq!(node.stores().lifecycle(*id), Lifecycle::Committed);
                assert!(verifies(node, *id));
            }
            assert!(node.stores().pending.is_empty());
            assert_eq!(node.stores().dead_count(), 0);
        }
        for client in &clients {
            assert_eq!(client.voted(), 3);
        }
    }

    fn revealed(node: &Node, client_id: u64) -> usize {
        let pulled = node.pull_pending_blocks(PullPendingBlocksRequest { client_id });
        assert!(pulled.status);
        pulled.headers.len()
    }

    #[tokio::test]
    async fn headers_stay_hidden_until_the_owners_hold_the_body() {
        let cluster = Cluster::new(4, |id| ServerConfig { tx_batch_size: 2, tick_interval_ms: 10, ..sized(4, id) });
        let one = cluster.node(1);
        one.submit_transactions(Generator::new(1, 8).generate(4));
        // owned by {2, 3} and {3, 4}
        assert_eq!(one.produce(), Some(1_000_001));
        assert_eq!(one.produce(), Some(1_000_002));

        let relayer = one.relayer(cluster.net.clone());
        assert_eq!(relayer.flush_to(2, Channel::Blocks).await.unwrap(), 2);
        assert_eq!(cluster.flush(Channel::Sync).await, 0);
        assert!(cluster.node(2).stores().pending.contains(1_000_002));
        assert!(!cluster.node(4).stores().pending.contains(1_000_002));
        for node in cluster.nodes() {
            assert_eq!(revealed(node, 1), 0);
        }

        assert_eq!(cluster.flush(Channel::Blocks).await, 4);
        assert_eq!(cluster.flush(Channel::Sync).await, 6);
        for node in cluster.nodes() {
            assert!(node.stores().is_synced(1_000_001) && node.stores().is_synced(1_000_002));
        }

        let clients: Vec<Client> = (1..=4)
            .map(|client_id| {
                let config = ClientConfig { client_id, client_count: 4, ..ClientConfig::default() };
                Client::new(&config, cluster.servers()).unwrap()
            })
            .collect();
        for client in &clients {
            client.register().await.unwrap();
        }
        for _ in 0..10 {
            for client in &clients {
                client.pull_headers().await;
                client.fetch_bodies().await;
                client.vote().await;
            }
            cluster.flush(Channel::Votes).await;
            cluster.drain_merges();
            cluster.flush_all().await;
        }
        for node in cluster.nodes() {
            for id in [1_000_001, 1_000_002] {
                assert_eq!(node.stores().lifecycle(id), Lifecycle::Committed);
                assert!(verifies(node, id));
            }
            assert!(node.stores().pending.is_empty());
            assert_eq!(node.stores().synced_count(), 0);
        }
    }

    #[tokio::test]
    async fn relay_failure_stops_the_node() {
        let cluster = Cluster::new(3, small_batches);
        cluster.net.take_down(2);
        let one = cluster.node(1);
        let run = tokio::time::timeout(Duration::from_secs(10), one.run(cluster.net.clone()));
        match run.await {
            Ok(Err(NodeError::Relay { peer: 2, .. })) => {}
            other => panic!("expected a relay failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn heartbeats_survive_a_down_peer() {
        let cluster = Cluster::new(3, three);
        cluster.net.take_down(3);
        let relayer = cluster.node(1).relayer(cluster.net.clone());
        assert_eq!(relayer.heartbeat().await, 1);
    }
}
