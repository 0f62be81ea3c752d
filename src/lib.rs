//! Permissioned block commit: servers produce blocks, clients vote on them
//! with BLS threshold shares, and each block's owning servers merge the votes
//! into one aggregate signature and broadcast the commit.

pub mod account;
pub mod app;
pub mod block;
pub mod client;
pub mod config;
pub mod error;
#[cfg(test)]
pub mod local;
pub mod msg;
pub mod node;
pub mod pending;
pub mod producer;
pub mod relay;
pub mod store;
pub mod threshold;
pub mod txn;
pub mod vote;
