//! Peer RPC layer.
//!
//! Every request between nodes is one [`PeerMessage`] wrapped in an
//! [`Envelope`], answered by exactly one [`PeerReply`]. Messages are decoded
//! once at the connection boundary; everything above this crate works with
//! the typed enums only.

mod backoff;
mod codec;
mod gossip;
mod local;
mod server;
mod transport;

pub use backoff::ExponentialBackoff;
pub use codec::{read_frame, write_frame};
pub use gossip::GossipClient;
pub use local::{LocalNetwork, LocalTransport};
pub use server::{PeerHandler, PeerServer};
pub use transport::{PeerTransport, TcpTransport};

use bytes::Bytes;
use membership::GossipDigest;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use storage::{NodeId, VersionedValue};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Apply a coordinator's write.
    WriteReplicate { key: Bytes, value: VersionedValue },
    /// Return the stored version of a key, tombstones included.
    ReadFetch { key: Bytes },
    /// Replay a write that was held back while this node was unreachable.
    HintReplay { key: Bytes, value: VersionedValue },
    Gossip(GossipDigest),
    Ping,
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::WriteReplicate { .. } => "write-replicate",
            PeerMessage::ReadFetch { .. } => "read-fetch",
            PeerMessage::HintReplay { .. } => "hint-replay",
            PeerMessage::Gossip(_) => "gossip",
            PeerMessage::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    InvalidKey,
    InvalidValue,
    Storage,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerReply {
    /// `applied` is false when the replica already held an equal or newer
    /// version. Either way the replica now holds at least this version.
    Ack { applied: bool },
    Value(Option<VersionedValue>),
    Gossip(GossipDigest),
    Pong { node: NodeId },
    Error { kind: RemoteErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub request_id: Uuid,
    pub from: NodeId,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(from: NodeId, body: T) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            from,
            body,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Peer {0} is unreachable")]
    Unreachable(String),
}

impl From<bincode::Error> for NetworkError {
    fn from(err: bincode::Error) -> Self {
        NetworkError::Serialization(err.to_string())
    }
}

impl NetworkError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetworkError::Timeout(_))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: NodeId,
    pub listen_addr: String,
    pub call_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_frame_size: usize,
    pub max_idle_per_peer: usize,
    /// Template for the per-peer delay applied after a failed connect.
    pub reconnect_backoff: ExponentialBackoff,
}

impl Config {
    pub fn new(node_id: NodeId, listen_addr: impl Into<String>) -> Self {
        Self {
            node_id,
            listen_addr: listen_addr.into(),
            call_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            max_frame_size: 4 * 1024 * 1024,
            max_idle_per_peer: 8,
            reconnect_backoff: ExponentialBackoff::default(),
        }
    }
}
