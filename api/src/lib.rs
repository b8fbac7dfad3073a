//! HTTP surfaces of a node: the client key-value API and the admin API.

mod admin;
mod error;
mod handlers;
mod server;

pub use error::{ApiError, ApiResult};
pub use server::Server;

use membership::Membership;
use replication::Coordinator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client API listen address, host:port.
    pub api_addr: String,
    /// Admin API listen address, host:port.
    pub admin_addr: String,
    /// Replication factor, reported by the ring inspection endpoints.
    pub replication_factor: usize,
}

pub struct AppState {
    pub coordinator: Coordinator,
    pub membership: Arc<Membership>,
    pub replication_factor: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
    pub key: String,
    pub counter: u64,
    pub origin: String,
    pub acks: usize,
    pub required: usize,
    pub hinted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub ring_epoch: u64,
    pub members: usize,
    pub vnodes: usize,
    pub clock: u64,
    pub live_keys: u64,
    pub tombstones: u64,
    pub value_bytes: u64,
    pub pending_hints: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingNode {
    pub id: String,
    pub peer_addr: String,
    pub api_addr: String,
    pub vnodes: usize,
    /// Share of the hash space this node's vnodes own, 0.0 to 1.0.
    pub ownership: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingResponse {
    pub epoch: u64,
    pub vnodes: usize,
    pub replication_factor: usize,
    pub nodes: Vec<RingNode>,
}
