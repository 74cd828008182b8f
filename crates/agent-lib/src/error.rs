//! Error types for the watch/detect/dedup/notify pipeline

use thiserror::Error;

use crate::models::{NamespaceScope, ResourceKind};

/// Failures talking to the cluster API
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Credentials or endpoint could not be resolved
    #[error("failed to connect to cluster: {0}")]
    Connect(String),

    #[error("failed to list {kind} in namespace scope {scope}: {message}")]
    List {
        kind: ResourceKind,
        scope: NamespaceScope,
        message: String,
    },

    #[error("watch stream for {kind} failed: {message}")]
    Watch { kind: ResourceKind, message: String },
}

/// Deduplication cache failures
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("deduplication cache used before init")]
    NotInitialized,

    #[error("deduplication cache already initialized")]
    AlreadyInitialized,

    #[error("deduplication store error: {0}")]
    Store(#[from] sled::Error),

    #[error("deduplication store io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Webhook delivery failures. All of them are recoverable.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to build http client: {0}")]
    Client(String),

    #[error("failed to deliver notification to {destination}: {message}")]
    Transport {
        destination: String,
        message: String,
    },

    #[error("notification sink {destination} answered {status}")]
    Status { destination: String, status: u16 },
}

/// Errors raised while starting a watch session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid watch session {name}: {reason}")]
    InvalidSpec { name: String, reason: String },

    /// The initial list failed; the session never started
    #[error("watch session {name} failed its initial list: {source}")]
    InitialList {
        name: String,
        #[source]
        source: ClusterError,
    },
}

/// Errors from routing one message through cache and notifier
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Delivery(#[from] NotifyError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl DispatchError {
    /// Whether a later trigger for the same message can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            DispatchError::Delivery(_) => true,
            DispatchError::Cache(CacheError::NotInitialized) => false,
            DispatchError::Cache(_) => true,
        }
    }
}

/// Fatal orchestrator errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("initial inventory failed: {0}")]
    Inventory(#[source] ClusterError),

    #[error("failed to initialize deduplication cache: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Session(#[from] SessionError),
}
