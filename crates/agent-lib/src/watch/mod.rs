//! Resource watch sessions
//!
//! A session keeps a live view of one resource collection (kind plus
//! namespace scope) and calls its handlers for every add, delete and update
//! it observes:
//! - Initial full list, which fails the session loudly if it cannot be read
//! - Incremental change stream, reopened when it ends
//! - Periodic full re-list that heals missed changes

mod session;
mod store;


pub use session::{WatchSession, WatchSessionHandle};
pub use store::ObjectStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SessionError;
use crate::models::{NamespaceScope, ResourceChangeEvent, ResourceKind};

/// Resync interval for namespaced pod sessions
pub const POD_RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Resync interval for node and event sessions
pub const CLUSTER_RESYNC_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Reacts to changes delivered by a watch session
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle(&self, change: &ResourceChangeEvent);
}

/// A handler slot: either nothing is registered, or a handler is
#[derive(Clone, Default)]
pub enum Handler {
    #[default]
    Absent,
    Present(Arc<dyn ChangeHandler>),
}

impl Handler {
    pub fn present(handler: impl ChangeHandler + 'static) -> Self {
        Handler::Present(Arc::new(handler))
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Handler::Present(_))
    }

    async fn invoke(&self, change: &ResourceChangeEvent) {
        if let Handler::Present(handler) = self {
            handler.handle(change).await;
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Absent => write!(f, "Absent"),
            Handler::Present(_) => write!(f, "Present"),
        }
    }
}

/// Handlers for the three kinds of change
#[derive(Debug, Clone, Default)]
pub struct HandlerSet {
    pub on_add: Handler,
    pub on_delete: Handler,
    pub on_update: Handler,
}

impl HandlerSet {
    /// Same handler for adds and deletes, no update handler
    pub fn add_and_delete(handler: Arc<dyn ChangeHandler>) -> Self {
        Self {
            on_add: Handler::Present(handler.clone()),
            on_delete: Handler::Present(handler),
            on_update: Handler::Absent,
        }
    }

    pub(crate) async fn dispatch(&self, change: &ResourceChangeEvent) {
        let slot = match change {
            ResourceChangeEvent::Added(_) => &self.on_add,
            ResourceChangeEvent::Deleted(_) => &self.on_delete,
            ResourceChangeEvent::Updated { .. } => &self.on_update,
        };
        slot.invoke(change).await;
    }
}

/// What a session watches and how it reacts. Fixed once the session starts.
#[derive(Debug, Clone)]
pub struct WatchSessionSpec {
    pub name: String,
    pub kind: ResourceKind,
    pub scope: NamespaceScope,
    pub resync_interval: Duration,
    pub handlers: HandlerSet,
}

impl WatchSessionSpec {
    pub fn new(
        kind: ResourceKind,
        scope: NamespaceScope,
        resync_interval: Duration,
        handlers: HandlerSet,
    ) -> Self {
        Self {
            name: format!("watch/{}/{}", kind, scope),
            kind,
            scope,
            resync_interval,
            handlers,
        }
    }

    /// Pods of one namespace, resynced every five minutes
    pub fn pods(namespace: &str, handlers: HandlerSet) -> Self {
        Self::new(
            ResourceKind::Pod,
            NamespaceScope::namespace(namespace),
            POD_RESYNC_INTERVAL,
            handlers,
        )
    }

    /// All nodes, resynced every thirty minutes
    pub fn nodes(handlers: HandlerSet) -> Self {
        Self::new(
            ResourceKind::Node,
            NamespaceScope::All,
            CLUSTER_RESYNC_INTERVAL,
            handlers,
        )
    }

    /// Cluster events within `scope`, resynced every thirty minutes
    pub fn events(scope: NamespaceScope, handlers: HandlerSet) -> Self {
        Self::new(ResourceKind::Event, scope, CLUSTER_RESYNC_INTERVAL, handlers)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.resync_interval.is_zero() {
            return Err(SessionError::InvalidSpec {
                name: self.name.clone(),
                reason: "resync interval must be positive".to_string(),
            });
        }
        if let NamespaceScope::Namespace(ns) = &self.scope {
            if ns.is_empty() {
                return Err(SessionError::InvalidSpec {
                    name: self.name.clone(),
                    reason: "namespace name is empty".to_string(),
                });
            }
        }
        Ok(())
    }
}
