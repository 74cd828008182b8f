//! Observability infrastructure for the OOM notifier
//!
//! Provides:
//! - Prometheus metrics (notifications, scans, watch errors, active sessions)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::models::ContainerTerminationRecord;

/// Histogram buckets for scan latency (in seconds)
const SCAN_LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    notifications_sent: IntCounter,
    notifications_suppressed: IntCounter,
    delivery_failures: IntCounter,
    scans: IntCounter,
    scan_errors: IntCounter,
    scan_latency_seconds: Histogram,
    oom_kills_detected: IntCounter,
    watch_errors: IntCounter,
    active_sessions: IntGauge,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            notifications_sent: register_int_counter!(
                "oom_notifier_notifications_sent_total",
                "Notifications delivered to the destination"
            )
            .expect("Failed to register notifications_sent"),

            notifications_suppressed: register_int_counter!(
                "oom_notifier_notifications_suppressed_total",
                "Notifications skipped because they were already sent"
            )
            .expect("Failed to register notifications_suppressed"),

            delivery_failures: register_int_counter!(
                "oom_notifier_delivery_failures_total",
                "Notification deliveries that failed"
            )
            .expect("Failed to register delivery_failures"),

            scans: register_int_counter!(
                "oom_notifier_scans_total",
                "OOM kill scans started"
            )
            .expect("Failed to register scans"),

            scan_errors: register_int_counter!(
                "oom_notifier_scan_errors_total",
                "OOM kill scans aborted by a list failure"
            )
            .expect("Failed to register scan_errors"),

            scan_latency_seconds: register_histogram!(
                "oom_notifier_scan_latency_seconds",
                "Time spent listing pods and inspecting container statuses",
                SCAN_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register scan_latency_seconds"),

            oom_kills_detected: register_int_counter!(
                "oom_notifier_oom_kills_detected_total",
                "OOM-killed containers reported by scans"
            )
            .expect("Failed to register oom_kills_detected"),

            watch_errors: register_int_counter!(
                "oom_notifier_watch_errors_total",
                "Watch stream and re-list errors"
            )
            .expect("Failed to register watch_errors"),

            active_sessions: register_int_gauge!(
                "oom_notifier_active_watch_sessions",
                "Watch sessions currently running"
            )
            .expect("Failed to register active_sessions"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn inc_notifications_sent(&self) {
        self.inner().notifications_sent.inc();
    }

    pub fn inc_notifications_suppressed(&self) {
        self.inner().notifications_suppressed.inc();
    }

    pub fn inc_delivery_failures(&self) {
        self.inner().delivery_failures.inc();
    }

    pub fn inc_scans(&self) {
        self.inner().scans.inc();
    }

    pub fn inc_scan_errors(&self) {
        self.inner().scan_errors.inc();
    }

    /// Record a scan latency observation
    pub fn observe_scan_latency(&self, duration_secs: f64) {
        self.inner().scan_latency_seconds.observe(duration_secs);
    }

    pub fn inc_oom_kills_detected(&self, count: u64) {
        self.inner().oom_kills_detected.inc_by(count);
    }

    pub fn inc_watch_errors(&self) {
        self.inner().watch_errors.inc();
    }

    pub fn inc_active_sessions(&self) {
        self.inner().active_sessions.inc();
    }

    pub fn dec_active_sessions(&self) {
        self.inner().active_sessions.dec();
    }
}

/// Structured logger for agent lifecycle and audit records
///
/// Every record carries a stable `event` field and the instance name.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, connect_mode: &str) {
        info!(
            event = "agent_started",
            instance = %self.instance,
            agent_version = %version,
            connect_mode = %connect_mode,
            "OOM notifier started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            instance = %self.instance,
            reason = %reason,
            "OOM notifier shutting down"
        );
    }

    /// Log the initial cluster inventory
    pub fn log_inventory(&self, pod_count: usize, node_names: &[String]) {
        info!(
            event = "cluster_inventory",
            instance = %self.instance,
            pods = pod_count,
            nodes = node_names.len(),
            node_names = ?node_names,
            "There are {} pods and {} nodes in the cluster",
            pod_count,
            node_names.len()
        );
    }

    pub fn log_session_started(&self, session: &str) {
        info!(
            event = "session_started",
            instance = %self.instance,
            session = %session,
            "Watch session running"
        );
    }

    pub fn log_session_stopped(&self, session: &str, clean: bool) {
        if clean {
            info!(
                event = "session_stopped",
                instance = %self.instance,
                session = %session,
                "Watch session stopped"
            );
        } else {
            warn!(
                event = "session_stopped",
                instance = %self.instance,
                session = %session,
                "Watch session task ended abnormally"
            );
        }
    }

    /// Log a detected OOM kill
    pub fn log_oom_kill(&self, record: &ContainerTerminationRecord) {
        warn!(
            event = "oom_kill_detected",
            instance = %self.instance,
            pod_name = %record.pod_name,
            namespace = %record.namespace,
            container = %record.container_name,
            restart_count = record.restart_count,
            finished_at = ?record.finished_at,
            "Container was OOM killed"
        );
    }

    pub fn log_notification_sent(&self, fingerprint: &str, text: &str) {
        info!(
            event = "notification_sent",
            instance = %self.instance,
            fingerprint = %fingerprint,
            text = %text,
            "Notification delivered"
        );
    }

    pub fn log_notification_suppressed(&self, fingerprint: &str, reason: &str) {
        info!(
            event = "notification_suppressed",
            instance = %self.instance,
            fingerprint = %fingerprint,
            reason = %reason,
            "Notification already handled"
        );
    }

    pub fn log_notification_failed(&self, fingerprint: &str, error: &str) {
        warn!(
            event = "notification_failed",
            instance = %self.instance,
            fingerprint = %fingerprint,
            error = %error,
            "Notification delivery failed, will retry on a later trigger"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_metrics_creation() {
        // Metrics live in the global Prometheus registry, so only exercise them here
        let metrics = AgentMetrics::new();

        metrics.inc_notifications_sent();
        metrics.inc_notifications_suppressed();
        metrics.inc_delivery_failures();
        metrics.inc_scans();
        metrics.observe_scan_latency(0.02);
        metrics.inc_oom_kills_detected(2);
        metrics.inc_watch_errors();
    }

    #[test]
    fn test_metrics_are_gathered_with_prefix() {
        let metrics = AgentMetrics::new();
        metrics.inc_scans();

        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        assert!(names.contains(&"oom_notifier_scans_total".to_string()));
        assert!(names.contains(&"oom_notifier_active_watch_sessions".to_string()));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("oom-notifier-0");
        assert_eq!(logger.instance, "oom-notifier-0");
    }
}
