use thiserror::Error;

use crate::block::ServerId;
use crate::config::ConfigError;
use crate::msg::CodecError;
use crate::relay::Channel;
use crate::threshold::ThresholdError;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("{0} answered with a failed status")]
    Status(&'static str),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("no route to server {0}")]
    NoRoute(ServerId),
}

impl From<reqwest::Error> for RpcError {
    fn from(e: reqwest::Error) -> Self {
        RpcError::Transport(e.to_string())
    }
}

/// Failures that stop a server.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error("relay of {channel:?} to server {peer} failed: {source}")]
    Relay {
        peer: ServerId,
        channel: Channel,
        #[source]
        source: RpcError,
    },
    #[error("node is already running")]
    AlreadyRunning,
    #[error("background task failed: {0}")]
    Task(String),
    #[error("http server: {0}")]
    Serve(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no server accepted the registration")]
    NotRegistered,
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("background task failed: {0}")]
    Task(String),
}
