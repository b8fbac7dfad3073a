use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParavonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Preflight failed: {0}")]
    Preflight(#[from] system::PreflightError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Topology error: {0}")]
    Topology(#[from] topology::TopologyError),

    #[error("Membership error: {0}")]
    Membership(#[from] membership::MembershipError),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("Replication error: {0}")]
    Replication(#[from] replication::ReplicationError),

    #[error("API error: {0}")]
    Api(#[from] api::ApiError),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, ParavonError>;
