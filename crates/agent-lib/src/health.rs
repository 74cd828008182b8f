//! Component health and readiness
//!
//! The fixed parts of the agent report under a [`Component`] name, each
//! watch session under its session name. The HTTP probes read from the same
//! registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

/// Fixed parts of the agent tracked next to the watch sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    /// Cluster API reachability during startup
    Cluster,
    DedupCache,
    /// Webhook delivery
    Notifier,
    /// OOM scans triggered by events
    Detector,
}

impl Component {
    pub const fn name(self) -> &'static str {
        match self {
            Component::Cluster => "cluster",
            Component::DedupCache => "dedup_cache",
            Component::Notifier => "notifier",
            Component::Detector => "detector",
        }
    }
}

impl AsRef<str> for Component {
    fn as_ref(&self) -> &str {
        self.name()
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered from best to worst; the overall status is the worst one reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Still delivering, but a watch, scan or delivery failed recently
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub status: HealthStatus,
    /// Last failure, cleared once the component recovers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of the liveness probe
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentReport>,
}

impl HealthReport {
    pub fn status_of(&self, name: impl AsRef<str>) -> Option<HealthStatus> {
        self.components.get(name.as_ref()).map(|report| report.status)
    }
}

/// Body of the readiness probe
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    components: BTreeMap<String, ComponentReport>,
    sessions_running: bool,
}

/// Shared view of component health and of whether the sessions are running
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<State>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `name` as healthy
    pub async fn register(&self, name: impl AsRef<str>) {
        self.set(name, HealthStatus::Healthy, None).await;
    }

    /// Stop tracking `name`, e.g. a watch session that stopped
    pub async fn deregister(&self, name: impl AsRef<str>) {
        self.state.write().await.components.remove(name.as_ref());
    }

    pub async fn set_healthy(&self, name: impl AsRef<str>) {
        self.set(name, HealthStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: impl AsRef<str>, message: impl Into<String>) {
        self.set(name, HealthStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, name: impl AsRef<str>, message: impl Into<String>) {
        self.set(name, HealthStatus::Unhealthy, Some(message.into()))
            .await;
    }

    async fn set(&self, name: impl AsRef<str>, status: HealthStatus, message: Option<String>) {
        self.state
            .write()
            .await
            .components
            .insert(name.as_ref().to_string(), ComponentReport { status, message });
    }

    /// Flipped on once every watch session started, off at shutdown
    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.sessions_running = ready;
    }

    pub async fn health(&self) -> HealthReport {
        let state = self.state.read().await;
        let status = state
            .components
            .values()
            .map(|report| report.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        HealthReport {
            status,
            components: state.components.clone(),
        }
    }

    /// Ready while the sessions run and no component is unhealthy
    pub async fn readiness(&self) -> Readiness {
        let state = self.state.read().await;
        if !state.sessions_running {
            return Readiness {
                ready: false,
                reason: Some("watch sessions not running".to_string()),
            };
        }

        let unhealthy = state
            .components
            .iter()
            .find(|(_, report)| report.status == HealthStatus::Unhealthy);

        match unhealthy {
            Some((name, _)) => Readiness {
                ready: false,
                reason: Some(format!("{} is unhealthy", name)),
            },
            None => Readiness {
                ready: true,
                reason: None,
            },
        }
    }
}
