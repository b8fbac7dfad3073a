pub mod config;
pub mod error;
pub mod node;
pub mod peer;

pub use config::Config;
pub use error::{ParavonError, Result};
pub use node::Node;
pub use peer::PeerRouter;

// Re-export key types from workspace crates
pub use api;
pub use membership;
pub use network;
pub use replication;
pub use storage;
pub use system;
pub use topology;
