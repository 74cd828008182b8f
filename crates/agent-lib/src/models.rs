//! Core data models for the OOM notifier

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use url::Url;

/// Termination reason the kubelet reports for out-of-memory kills
pub const OOM_KILLED_REASON: &str = "OOMKilled";

/// Namespace holding user workloads by default
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace holding cluster system components
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Cluster resource collections the agent observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pod,
    Node,
    Event,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Pod => write!(f, "pods"),
            ResourceKind::Node => write!(f, "nodes"),
            ResourceKind::Event => write!(f, "events"),
        }
    }
}

/// Namespace scope of a list or watch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NamespaceScope {
    /// Every namespace in the cluster
    All,
    /// A single named namespace
    Namespace(String),
}

impl NamespaceScope {
    pub fn namespace(name: impl Into<String>) -> Self {
        NamespaceScope::Namespace(name.into())
    }

    /// Whether an object living in `namespace` falls inside this scope.
    /// Cluster-scoped objects (no namespace) are always in scope.
    pub fn contains(&self, namespace: Option<&str>) -> bool {
        match (self, namespace) {
            (NamespaceScope::All, _) | (_, None) => true,
            (NamespaceScope::Namespace(ns), Some(other)) => ns == other,
        }
    }
}

impl fmt::Display for NamespaceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespaceScope::All => write!(f, "all"),
            NamespaceScope::Namespace(ns) => write!(f, "{}", ns),
        }
    }
}

/// Snapshot of a cluster object at the moment a change was observed
#[derive(Debug, Clone)]
pub enum ClusterObject {
    Pod(Pod),
    Node(Node),
    Event(Event),
}

impl ClusterObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ClusterObject::Pod(_) => ResourceKind::Pod,
            ClusterObject::Node(_) => ResourceKind::Node,
            ClusterObject::Event(_) => ResourceKind::Event,
        }
    }

    pub fn name(&self) -> String {
        match self {
            ClusterObject::Pod(pod) => pod.name_any(),
            ClusterObject::Node(node) => node.name_any(),
            ClusterObject::Event(event) => event.name_any(),
        }
    }

    pub fn namespace(&self) -> Option<String> {
        match self {
            ClusterObject::Pod(pod) => pod.namespace(),
            ClusterObject::Node(_) => None,
            ClusterObject::Event(event) => event.namespace(),
        }
    }

    pub fn resource_version(&self) -> Option<String> {
        match self {
            ClusterObject::Pod(pod) => pod.resource_version(),
            ClusterObject::Node(node) => node.resource_version(),
            ClusterObject::Event(event) => event.resource_version(),
        }
    }

    /// Store key, unique within one resource collection
    pub fn key(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{}/{}", ns, self.name()),
            None => self.name(),
        }
    }
}

/// A change observed by a watch session
#[derive(Debug, Clone)]
pub enum ResourceChangeEvent {
    Added(ClusterObject),
    Deleted(ClusterObject),
    Updated {
        old: ClusterObject,
        new: ClusterObject,
    },
}

impl ResourceChangeEvent {
    /// The most recent snapshot carried by the change
    pub fn object(&self) -> &ClusterObject {
        match self {
            ResourceChangeEvent::Added(obj) | ResourceChangeEvent::Deleted(obj) => obj,
            ResourceChangeEvent::Updated { new, .. } => new,
        }
    }

    /// Human-readable notification text for pod, node and event changes.
    /// Updates carry no message.
    pub fn describe(&self) -> Option<String> {
        let added = match self {
            ResourceChangeEvent::Added(_) => true,
            ResourceChangeEvent::Deleted(_) => false,
            ResourceChangeEvent::Updated { .. } => return None,
        };

        let text = match self.object() {
            ClusterObject::Pod(pod) => {
                let namespace = pod.namespace().unwrap_or_default();
                if added {
                    format!("New Pod added: {} on {}", pod.name_any(), namespace)
                } else {
                    format!("Deleted Pod: {} on {}", pod.name_any(), namespace)
                }
            }
            ClusterObject::Node(node) => {
                if added {
                    format!("New Node added: {}", node.name_any())
                } else {
                    format!("Deleted Node: {}", node.name_any())
                }
            }
            ClusterObject::Event(event) => {
                let reason = event.reason.as_deref().unwrap_or_default();
                let message = event.message.as_deref().unwrap_or_default();
                if added {
                    format!("New Event: {}\n{}", reason, message)
                } else {
                    format!("Deleted Event: {}\n{}", reason, message)
                }
            }
        };
        Some(text)
    }
}

/// Last termination of one container, as seen during an OOM scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerTerminationRecord {
    pub pod_name: String,
    pub namespace: String,
    pub container_name: String,
    pub restart_count: u32,
    pub reason: String,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ContainerTerminationRecord {
    /// Notification text for this termination
    pub fn message(&self) -> String {
        let finished = self
            .finished_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| "unknown".to_string());

        format!(
            "Pod {} Container {} has been restarted {} time(s) due to {} at {}",
            self.pod_name, self.container_name, self.restart_count, self.reason, finished
        )
    }
}

/// A message bound for the notification sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub text: String,
    pub destination: Url,
}

/// Webhook body: the message under a single text field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub text: String,
}
