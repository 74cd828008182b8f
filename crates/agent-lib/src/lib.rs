//! Agent library for Kubernetes OOM kill notifications
//!
//! This crate provides the core functionality for:
//! - Watching pods, nodes and events through long-lived watch sessions
//! - Detecting containers whose last termination was an OOM kill
//! - Deduplicating notifications in an embedded store
//! - Delivering messages to a webhook sink
//! - Health checks and observability

pub mod cache;
pub mod cluster;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod models;
pub mod notifier;
pub mod observability;
pub mod orchestrator;
pub mod watch;

#[cfg(test)]
mod test_utils;

pub use cache::{CacheLocation, DedupCache, Fingerprint};
pub use cluster::{ClusterClient, ConnectMode, KubeClusterClient};
pub use detector::OomKillDetector;
pub use dispatch::{AlertDispatcher, DispatchOutcome};
pub use error::{
    CacheError, ClusterError, DispatchError, NotifyError, OrchestratorError, SessionError,
};
pub use health::{Component, HealthRegistry, HealthReport, HealthStatus, Readiness};
pub use models::*;
pub use notifier::{Notifier, NotifierConfig, WebhookNotifier};
pub use observability::{AgentMetrics, StructuredLogger};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
