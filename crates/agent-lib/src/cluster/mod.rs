//! Cluster read/watch capability
//!
//! The rest of the agent only sees the [`ClusterClient`] trait: list a
//! resource collection, or subscribe to its changes. Credential and endpoint
//! resolution happen once, when the concrete client is built.

mod kube_client;

pub use kube_client::{ConnectMode, KubeClusterClient};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::ClusterError;
use crate::models::{ClusterObject, NamespaceScope, ResourceKind};

/// One item of a change stream
#[derive(Debug, Clone)]
pub enum WatchSignal {
    /// Object created or modified
    Applied(ClusterObject),
    /// Object removed
    Deleted(ClusterObject),
    /// The stream re-listed the collection; this is its full current content
    Relisted(Vec<ClusterObject>),
}

/// Stream of watch signals. Errors are transient; the stream keeps going
/// until it returns `None`.
pub type ChangeStream = BoxStream<'static, Result<WatchSignal, ClusterError>>;

/// List and watch access to cluster resource collections
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List every object of `kind` within `scope`
    async fn list(
        &self,
        kind: ResourceKind,
        scope: &NamespaceScope,
    ) -> Result<Vec<ClusterObject>, ClusterError>;

    /// Subscribe to changes of `kind` within `scope`
    fn watch(&self, kind: ResourceKind, scope: &NamespaceScope) -> ChangeStream;
}
