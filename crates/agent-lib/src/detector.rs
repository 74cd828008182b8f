//! OOM kill detection
//!
//! Lists the pods in scope and reports every container whose last
//! termination was an out-of-memory kill.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, trace};

use crate::cluster::ClusterClient;
use crate::error::ClusterError;
use crate::models::{
    ClusterObject, ContainerTerminationRecord, NamespaceScope, ResourceKind, OOM_KILLED_REASON,
};
use crate::observability::AgentMetrics;

/// Scans pod container statuses for OOM kills
pub struct OomKillDetector {
    client: Arc<dyn ClusterClient>,
    metrics: AgentMetrics,
}

impl OomKillDetector {
    pub fn new(client: Arc<dyn ClusterClient>, metrics: AgentMetrics) -> Self {
        Self { client, metrics }
    }

    /// One record per OOM-killed container, in the order the API returned
    /// the pods. A list failure aborts the scan.
    pub async fn scan(
        &self,
        scope: &NamespaceScope,
    ) -> Result<Vec<ContainerTerminationRecord>, ClusterError> {
        let start = Instant::now();
        self.metrics.inc_scans();

        let objects = match self.client.list(ResourceKind::Pod, scope).await {
            Ok(objects) => objects,
            Err(e) => {
                self.metrics.inc_scan_errors();
                return Err(e);
            }
        };

        let records: Vec<_> = objects
            .iter()
            .filter_map(|obj| match obj {
                ClusterObject::Pod(pod) => Some(pod),
                _ => None,
            })
            .flat_map(oom_kills)
            .collect();

        self.metrics
            .observe_scan_latency(start.elapsed().as_secs_f64());
        self.metrics.inc_oom_kills_detected(records.len() as u64);
        debug!(
            scope = %scope,
            pods = objects.len(),
            oom_killed = records.len(),
            "OOM scan complete"
        );

        Ok(records)
    }
}

/// OOM-killed containers of a single pod
pub fn oom_kills(pod: &Pod) -> Vec<ContainerTerminationRecord> {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref());

    let Some(statuses) = statuses else {
        return Vec::new();
    };

    statuses
        .iter()
        .filter_map(|status| {
            let terminated = status.last_state.as_ref()?.terminated.as_ref()?;
            let reason = terminated.reason.as_deref()?;
            if reason != OOM_KILLED_REASON {
                trace!(
                    pod = %pod.name_any(),
                    container = %status.name,
                    reason = %reason,
                    "Skipping non-OOM termination"
                );
                return None;
            }

            Some(ContainerTerminationRecord {
                pod_name: pod.name_any(),
                namespace: pod.namespace().unwrap_or_default(),
                container_name: status.name.clone(),
                restart_count: u32::try_from(status.restart_count).unwrap_or(0),
                reason: reason.to_string(),
                finished_at: terminated.finished_at.as_ref().map(|t| t.0),
            })
        })
        .collect()
}
