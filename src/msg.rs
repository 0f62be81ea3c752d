//! Wire forms. Entities travel as named-field MessagePack maps so client and
//! servers can evolve fields independently; RPC envelopes use the same codec.

use std::marker::PhantomData;

use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::block::{BlockId, ClientId, ServerId};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

pub fn encode<T: Serialize>(x: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(x)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// An encoded `T`, opaque until someone asks for it.
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct Serialized<T> {
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
    #[serde(skip)]
    _phantom: PhantomData<T>,
}

impl<T> Clone for Serialized<T> {
    fn clone(&self) -> Self {
        Self { bytes: self.bytes.clone(), _phantom: PhantomData }
    }
}

impl<T> std::fmt::Debug for Serialized<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Serialized({} bytes)", self.bytes.len())
    }
}

impl<T: Serialize + DeserializeOwned> Serialized<T> {
    pub fn new(x: &T) -> Result<Self, CodecError> {
        Ok(Self { bytes: encode(x)?, _phantom: PhantomData })
    }

    pub fn deser(&self) -> Result<T, CodecError> {
        decode(&self.bytes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: bool,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self { status: true }
    }

    pub fn failed() -> Self {
        Self { status: false }
    }
}

pub mod client {
    use super::*;
    use crate::block::{Block, BlockHeader};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RegisterRequest {
        pub client_id: ClientId,
        #[serde(with = "serde_bytes")]
        pub public_key: Vec<u8>,
        // Identity signature over the big-endian client id.
        #[serde(with = "serde_bytes")]
        pub proof: Vec<u8>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RegisterResponse {
        pub status: bool,
        pub client_id: ClientId,
        #[serde(with = "serde_bytes")]
        pub threshold_share: Vec<u8>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct HeartbeatRequest {
        pub client_id: ClientId,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PullPendingBlocksRequest {
        pub client_id: ClientId,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PullPendingBlocksResponse {
        pub status: bool,
        pub headers: Vec<Serialized<BlockHeader>>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct GetBlocksRequest {
        pub client_id: ClientId,
        pub headers: Vec<Serialized<BlockHeader>>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct GetBlocksResponse {
        pub status: bool,
        pub blocks: Vec<Serialized<Block>>,
    }

    /// Each block carries the submitting client's vote in its `votes` map.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct VoteBlocksRequest {
        pub client_id: ClientId,
        pub blocks: Vec<Serialized<Block>>,
    }
}

pub mod peer {
    use super::*;
    use crate::block::{Block, BlockVote};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct HeartbeatRequest {
        pub peer_id: ServerId,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RelayVoteRequest {
        pub peer_id: ServerId,
        pub votes: Vec<Serialized<BlockVote>>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RelayBlockRequest {
        pub peer_id: ServerId,
        pub blocks: Vec<Serialized<Block>>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct BcastCommitRequest {
        pub peer_id: ServerId,
        pub blocks: Vec<Serialized<Block>>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RelayBlockSyncRequest {
        pub peer_id: ServerId,
        pub block_ids: Vec<BlockId>,
    }
}
