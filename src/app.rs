//! HTTP plumbing. Every RPC is a POST whose body and reply are MessagePack
//! envelopes from `msg`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::DefaultBodyLimit;
use axum::{Router, routing};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::block::ServerId;
use crate::client::ServerApi;
use crate::error::{NodeError, RpcError};
use crate::msg::{self, client, peer, StatusResponse};
use crate::node::{ClientService, PeerService};
use crate::relay::PeerTransport;

pub const MSGPACK: &str = "application/msgpack";

// Block batches can be large.
const BODY_LIMIT: usize = 64 * 1024 * 1024;

mod handlers {
    use super::*;

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{header, StatusCode};
    use axum::response::{IntoResponse, Response};
    use tracing::{error, warn};

    fn handle<Req, Resp>(body: &[u8], call: impl FnOnce(Req) -> Resp) -> Response
    where
        Req: DeserializeOwned,
        Resp: Serialize,
    {
        let req = match msg::decode(body) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "undecodable request");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };
        match msg::encode(&call(req)) {
            Ok(bytes) => ([(header::CONTENT_TYPE, MSGPACK)], bytes).into_response(),
            Err(e) => {
                error!(error = %e, "encoding reply failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }

    pub async fn root(State(node): State<Arc<dyn ClientService>>) -> String {
        node.status()
    }

    pub async fn register(State(node): State<Arc<dyn ClientService>>, body: Bytes) -> Response {
        handle(&body, |req| node.register(req))
    }

    pub async fn heartbeat(State(node): State<Arc<dyn ClientService>>, body: Bytes) -> Response {
        handle(&body, |req| node.heartbeat(req))
    }

    pub async fn pull_pending_blocks(State(node): State<Arc<dyn ClientService>>, body: Bytes) -> Response {
        handle(&body, |req| node.pull_pending_blocks(req))
    }

    pub async fn get_blocks(State(node): State<Arc<dyn ClientService>>, body: Bytes) -> Response {
        handle(&body, |req| node.get_blocks(req))
    }

    pub async fn vote_blocks(State(node): State<Arc<dyn ClientService>>, body: Bytes) -> Response {
        handle(&body, |req| node.vote_blocks(req))
    }

    pub async fn peer_heartbeat(State(node): State<Arc<dyn PeerService>>, body: Bytes) -> Response {
        handle(&body, |req| node.peer_heartbeat(req))
    }

    pub async fn relay_vote(State(node): State<Arc<dyn PeerService>>, body: Bytes) -> Response {
        handle(&body, |req| node.relay_vote(req))
    }

    pub async fn relay_block(State(node): State<Arc<dyn PeerService>>, body: Bytes) -> Response {
        handle(&body, |req| node.relay_block(req))
    }

    pub async fn bcast_commit(State(node): State<Arc<dyn PeerService>>, body: Bytes) -> Response {
        handle(&body, |req| node.bcast_commit(req))
    }

    pub async fn relay_block_sync(State(node): State<Arc<dyn PeerService>>, body: Bytes) -> Response {
        handle(&body, |req| node.relay_block_sync(req))
    }
}

pub fn router(clients: Arc<dyn ClientService>, peers: Arc<dyn PeerService>) -> Router {
    let client_routes = Router::new()
        .route("/", routing::get(handlers::root))
        .route("/register", routing::post(handlers::register))
        .route("/heartbeat", routing::post(handlers::heartbeat))
        .route("/pull_pending_blocks", routing::post(handlers::pull_pending_blocks))
        .route("/get_blocks", routing::post(handlers::get_blocks))
        .route("/vote_blocks", routing::post(handlers::vote_blocks))
        .with_state(clients);
    let peer_routes = Router::new()
        .route("/peer/heartbeat", routing::post(handlers::peer_heartbeat))
        .route("/peer/relay_vote", routing::post(handlers::relay_vote))
        .route("/peer/relay_block", routing::post(handlers::relay_block))
        .route("/peer/bcast_commit", routing::post(handlers::bcast_commit))
        .route("/peer/relay_block_sync", routing::post(handlers::relay_block_sync))
        .with_state(peers);
    client_routes
        .merge(peer_routes)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(addr: SocketAddr, app: Router) -> Result<(), NodeError> {
    info!(%addr, "listening");
    axum::Server::try_bind(&addr)
        .map_err(|e| NodeError::Serve(e.to_string()))?
        .serve(app.into_make_service())
        .await
        .map_err(|e| NodeError::Serve(e.to_string()))
}

async fn post<Req, Resp>(http: &reqwest::Client, url: String, req: &Req) -> Result<Resp, RpcError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let body = msg::encode(req)?;
    let bytes = http
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, MSGPACK)
        .body(body)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    Ok(msg::decode(&bytes)?)
}

/// Peer calls over HTTP, addressed by server id.
pub struct HttpPeers {
    http: reqwest::Client,
    peers: BTreeMap<ServerId, String>,
}

impl HttpPeers {
    pub fn new(peers: BTreeMap<ServerId, String>) -> Self {
        Self { http: reqwest::Client::new(), peers }
    }

    fn url(&self, peer: ServerId, path: &str) -> Result<String, RpcError> {
        let base = self.peers.get(&peer).ok_or(RpcError::NoRoute(peer))?;
        Ok(format!("{}/peer/{}", base.trim_end_matches('/'), path))
    }
}

#[async_trait]
impl PeerTransport for HttpPeers {
    async fn heartbeat(&self, peer: ServerId, req: peer::HeartbeatRequest) -> Result<StatusResponse, RpcError> {
        post(&self.http, self.url(peer, "heartbeat")?, &req).await
    }

    async fn relay_votes(&self, peer: ServerId, req: peer::RelayVoteRequest) -> Result<StatusResponse, RpcError> {
        post(&self.http, self.url(peer, "relay_vote")?, &req).await
    }

    async fn relay_blocks(&self, peer: ServerId, req: peer::RelayBlockRequest) -> Result<StatusResponse, RpcError> {
        post(&self.http, self.url(peer, "relay_block")?, &req).await
    }

    async fn bcast_commits(&self, peer: ServerId, req: peer::BcastCommitRequest) -> Result<StatusResponse, RpcError> {
        post(&self.http, self.url(peer, "bcast_commit")?, &req).await
    }

    async fn relay_sync(&self, peer: ServerId, req: peer::RelayBlockSyncRequest) -> Result<StatusResponse, RpcError> {
        post(&self.http, self.url(peer, "relay_block_sync")?, &req).await
    }
}

/// One server as seen by a client.
pub struct HttpServer {
    http: reqwest::Client,
    base: String,
}

impl HttpServer {
    pub fn new(base: impl Into<String>) -> Self {
        let base: String = base.into();
        Self { http: reqwest::Client::new(), base: base.trim_end_matches('/').to_string() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }
}

#[async_trait]
impl ServerApi for HttpServer {
    fn name(&self) -> &str {
        &self.base
    }

    async fn register(&self, req: client::RegisterRequest) -> Result<client::RegisterResponse, RpcError> {
        post(&self.http, self.url("register"), &req).await
    }

    async fn heartbeat(&self, req: client::HeartbeatRequest) -> Result<StatusResponse, RpcError> {
        post(&self.http, self.url("heartbeat"), &req).await
    }

    async fn pull_pending_blocks(
        &self,
        req: client::PullPendingBlocksRequest,
    ) -> Result<client::PullPendingBlocksResponse, RpcError> {
        post(&self.http, self.url("pull_pending_blocks"), &req).await
    }

    async fn get_blocks(&self, req: client::GetBlocksRequest) -> Result<client::GetBlocksResponse, RpcError> {
        post(&self.http, self.url("get_blocks"), &req).await
    }

    async fn vote_blocks(&self, req: client::VoteBlocksRequest) -> Result<StatusResponse, RpcError> {
        post(&self.http, self.url("vote_blocks"), &req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::three;
    use crate::node::Node;

    async fn spawn(node: Arc<Node>) -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(node.clone(), node);
        tokio::spawn(axum::Server::from_tcp(listener).unwrap().serve(app.into_make_service()));
        addr
    }

    #[tokio::test]
    async fn client_calls_over_http() {
        let node = Arc::new(Node::new(three(1)).unwrap());
        let addr = spawn(node.clone()).await;
        let server = HttpServer::new(format!("http://{}/", addr));
        let identity = crate::account::Keypair::gen();
        let resp = server
            .register(client::RegisterRequest {
                client_id: 3,
                public_key: identity.public_bytes(),
                proof: identity.prove(3),
            })
            .await
            .unwrap();
        assert!(resp.status);
        assert_eq!(resp.threshold_share.len(), 32);
        let pulled = server
            .pull_pending_blocks(client::PullPendingBlocksRequest { client_id: 3 })
            .await
            .unwrap();
        assert!(pulled.status && pulled.headers.is_empty());

        let text = reqwest::get(format!("http://{}/", addr)).await.unwrap().text().await.unwrap();
        assert!(text.contains("server 1"));
    }

    #[tokio::test]
    async fn peer_calls_over_http() {
        let node = Arc::new(Node::new(three(2)).unwrap());
        let addr = spawn(node.clone()).await;
        let peers = HttpPeers::new([(2, format!("http://{}", addr))].into_iter().collect());
        let block = crate::block::tests::sample(1_000_001, 1);
        let resp = peers
            .relay_blocks(2, peer::RelayBlockRequest {
                peer_id: 1,
                blocks: vec![msg::Serialized::new(&block).unwrap()],
            })
            .await
            .unwrap();
        assert!(resp.status);
        assert!(node.stores().pending.contains(1_000_001));
        assert!(matches!(
            peers.heartbeat(3, peer::HeartbeatRequest { peer_id: 1 }).await,
            Err(RpcError::NoRoute(3))
        ));
    }

    #[tokio::test]
    async fn garbage_body_is_rejected() {
        let node = Arc::new(Node::new(three(1)).unwrap());
        let addr = spawn(node).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{}/vote_blocks", addr))
            .body(vec![0xc1u8])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
