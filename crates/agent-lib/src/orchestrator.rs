//! Agent lifecycle
//!
//! Takes the initial inventory, opens the deduplication cache, starts the
//! five watch sessions and waits for cancellation. Teardown stops the
//! sessions and closes the cache.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::cache::DedupCache;
use crate::cluster::ClusterClient;
use crate::detector::OomKillDetector;
use crate::dispatch::{AlertDispatcher, NotificationHandler, OomScanHandler};
use crate::error::OrchestratorError;
use crate::health::{Component, HealthRegistry};
use crate::models::{
    ClusterObject, NamespaceScope, ResourceKind, DEFAULT_NAMESPACE, KUBE_SYSTEM_NAMESPACE,
};
use crate::notifier::Notifier;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::watch::{HandlerSet, WatchSession, WatchSessionHandle, WatchSessionSpec};

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Notification destination
    pub destination: Url,
    /// Namespaces covered by the OOM scan
    pub scan_scope: NamespaceScope,
    /// How long teardown waits for the sessions to stop
    pub shutdown_timeout: Duration,
}

impl OrchestratorConfig {
    pub fn new(destination: Url) -> Self {
        Self {
            destination,
            scan_scope: NamespaceScope::All,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Pods and nodes present at startup
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub pod_count: usize,
    pub node_names: Vec<String>,
}

/// Wires the cluster, cache and notifier into running watch sessions
pub struct Orchestrator {
    client: Arc<dyn ClusterClient>,
    cache: Arc<DedupCache>,
    notifier: Arc<dyn Notifier>,
    config: OrchestratorConfig,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        cache: Arc<DedupCache>,
        notifier: Arc<dyn Notifier>,
        config: OrchestratorConfig,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            client,
            cache,
            notifier,
            config,
            health,
            metrics: AgentMetrics::new(),
            logger,
        }
    }

    /// Run until `cancel` fires. Startup failures are returned after the
    /// partially started state has been torn down.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        self.health.register(Component::Cluster).await;

        let inventory = match self.inventory().await {
            Ok(inventory) => inventory,
            Err(e) => {
                self.health
                    .set_unhealthy(Component::Cluster, e.to_string())
                    .await;
                return Err(e);
            }
        };
        self.logger
            .log_inventory(inventory.pod_count, &inventory.node_names);

        if let Err(e) = self.cache.init() {
            self.health
                .set_unhealthy(Component::DedupCache, e.to_string())
                .await;
            return Err(e.into());
        }
        self.health.register(Component::DedupCache).await;
        self.health.register(Component::Notifier).await;
        self.health.register(Component::Detector).await;

        let sessions_cancel = cancel.child_token();
        let handles = match self.start_sessions(&sessions_cancel).await {
            Ok(handles) => handles,
            Err(e) => {
                error!(error = %e, "Watch session failed to start, tearing down");
                sessions_cancel.cancel();
                return Err(e);
            }
        };

        self.health.set_ready(true).await;
        info!(sessions = handles.len(), "Agent ready");

        cancel.cancelled().await;
        self.health.set_ready(false).await;
        sessions_cancel.cancel();

        self.stop_sessions(handles).await;
        Ok(())
    }

    /// Pods across all namespaces and every node
    pub async fn inventory(&self) -> Result<Inventory, OrchestratorError> {
        let pods = self
            .client
            .list(ResourceKind::Pod, &NamespaceScope::All)
            .await
            .map_err(OrchestratorError::Inventory)?;
        let nodes = self
            .client
            .list(ResourceKind::Node, &NamespaceScope::All)
            .await
            .map_err(OrchestratorError::Inventory)?;

        let node_names = nodes
            .iter()
            .filter_map(|obj| match obj {
                ClusterObject::Node(node) => Some(node.name_any()),
                _ => None,
            })
            .collect();

        Ok(Inventory {
            pod_count: pods.len(),
            node_names,
        })
    }

    /// The five sessions the agent runs
    pub fn session_specs(&self) -> Vec<WatchSessionSpec> {
        let dispatcher = Arc::new(AlertDispatcher::new(
            self.cache.clone(),
            self.notifier.clone(),
            self.config.destination.clone(),
            self.health.clone(),
            self.metrics.clone(),
            self.logger.clone(),
        ));
        let detector = Arc::new(OomKillDetector::new(
            self.client.clone(),
            self.metrics.clone(),
        ));

        let notify = HandlerSet::add_and_delete(Arc::new(NotificationHandler::new(
            dispatcher.clone(),
        )));
        let scan = HandlerSet::add_and_delete(Arc::new(OomScanHandler::new(
            detector,
            dispatcher,
            self.config.scan_scope.clone(),
            self.health.clone(),
            self.logger.clone(),
        )));

        vec![
            WatchSessionSpec::pods(DEFAULT_NAMESPACE, notify.clone()),
            WatchSessionSpec::pods(KUBE_SYSTEM_NAMESPACE, notify.clone()),
            WatchSessionSpec::nodes(notify.clone()),
            WatchSessionSpec::events(NamespaceScope::namespace(DEFAULT_NAMESPACE), notify),
            WatchSessionSpec::events(NamespaceScope::All, scan),
        ]
    }

    async fn start_sessions(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<WatchSessionHandle>, OrchestratorError> {
        let mut handles = Vec::new();

        for spec in self.session_specs() {
            match WatchSession::start(
                spec,
                self.client.clone(),
                self.health.clone(),
                self.metrics.clone(),
                cancel.clone(),
            )
            .await
            {
                Ok(handle) => {
                    self.logger.log_session_started(handle.name());
                    handles.push(handle);
                }
                Err(e) => {
                    cancel.cancel();
                    // Started sessions see the cancellation; wait for them
                    // before the cache goes away
                    self.stop_sessions(handles).await;
                    return Err(e.into());
                }
            }
        }

        Ok(handles)
    }

    /// Wait for every session task, then close the cache. Sessions still
    /// running after the shutdown timeout are aborted.
    async fn stop_sessions(&self, handles: Vec<WatchSessionHandle>) {
        let aborts: Vec<_> = handles
            .iter()
            .map(|handle| (handle.name().to_string(), handle.abort_handle()))
            .collect();

        let stopped = join_all(handles.into_iter().map(|handle| async move {
            let name = handle.name().to_string();
            (name, handle.join().await)
        }));

        match tokio::time::timeout(self.config.shutdown_timeout, stopped).await {
            Ok(results) => {
                for (name, joined) in results {
                    self.logger.log_session_stopped(&name, joined.is_ok());
                }
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.shutdown_timeout.as_secs(),
                    "Watch sessions did not stop in time, aborting"
                );
                for (name, abort) in &aborts {
                    abort.abort();
                    self.logger.log_session_stopped(name, false);
                }
            }
        }

        for (name, _) in &aborts {
            self.health.deregister(name).await;
        }

        if let Err(e) = self.cache.close() {
            warn!(error = %e, "Failed to close deduplication cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::WatchSignal;
    use crate::error::SessionError;
    use crate::test_utils::{event, node, pod, pod_with_termination, wait_until, FakeCluster, RecordingNotifier};

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        cluster: Arc<FakeCluster>,
        cache: Arc<DedupCache>,
        notifier: Arc<RecordingNotifier>,
        health: HealthRegistry,
        orchestrator: Arc<Orchestrator>,
    }

    fn fixture() -> Fixture {
        let cluster = Arc::new(FakeCluster::new());
        let cache = Arc::new(DedupCache::ephemeral());
        let notifier = Arc::new(RecordingNotifier::new());
        let health = HealthRegistry::new();
        let orchestrator = Arc::new(Orchestrator::new(
            cluster.clone(),
            cache.clone(),
            notifier.clone(),
            OrchestratorConfig::new(Url::parse("https://hooks.example.com/services/x").unwrap()),
            health.clone(),
            StructuredLogger::new("test"),
        ));
        Fixture {
            cluster,
            cache,
            notifier,
            health,
            orchestrator,
        }
    }

    fn has(notifier: &RecordingNotifier, text: &str) -> bool {
        notifier.sent().iter().any(|s| s == text)
    }

    #[tokio::test]
    async fn test_inventory_counts_pods_and_names_nodes() {
        let f = fixture();
        f.cluster.set_objects(
            ResourceKind::Pod,
            vec![pod("a", "default", "1"), pod("b", "monitoring", "1")],
        );
        f.cluster
            .set_objects(ResourceKind::Node, vec![node("worker-1", "1")]);

        let inventory = f.orchestrator.inventory().await.unwrap();

        assert_eq!(inventory.pod_count, 2);
        assert_eq!(inventory.node_names, vec!["worker-1"]);
    }

    #[test]
    fn test_five_sessions_are_planned() {
        let f = fixture();
        let names: Vec<String> = f
            .orchestrator
            .session_specs()
            .into_iter()
            .map(|spec| spec.name)
            .collect();

        assert_eq!(
            names,
            vec![
                "watch/pods/default",
                "watch/pods/kube-system",
                "watch/nodes/all",
                "watch/events/default",
                "watch/events/all",
            ]
        );
    }

    #[tokio::test]
    async fn test_run_notifies_existing_objects_and_stops_on_cancel() {
        let f = fixture();
        f.cluster.set_objects(
            ResourceKind::Pod,
            vec![pod("web", "default", "1"), pod("other", "monitoring", "1")],
        );
        f.cluster
            .set_objects(ResourceKind::Node, vec![node("worker-1", "1")]);
        let cancel = CancellationToken::new();

        let orchestrator = f.orchestrator.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { orchestrator.run(token).await });

        assert!(wait_until(WAIT, || async { f.health.readiness().await.ready }).await);
        assert!(
            wait_until(WAIT, || async {
                has(&f.notifier, "New Pod added: web on default")
                    && has(&f.notifier, "New Node added: worker-1")
            })
            .await
        );
        assert!(!has(&f.notifier, "New Pod added: other on monitoring"));

        cancel.cancel();
        task.await.unwrap().unwrap();

        assert!(f.cache.path().is_none());
        assert!(!f.health.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_oom_kill_is_reported_once_across_triggers() {
        let f = fixture();
        f.cluster.set_objects(
            ResourceKind::Pod,
            vec![pod_with_termination("p1", "monitoring", "c1", "OOMKilled", 3)],
        );
        let cancel = CancellationToken::new();

        let orchestrator = f.orchestrator.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { orchestrator.run(token).await });
        assert!(wait_until(WAIT, || async { f.health.readiness().await.ready }).await);
        assert!(wait_until(WAIT, || async { f.cluster.watch_count(ResourceKind::Event) == 2 }).await);

        let oom = "Pod p1 Container c1 has been restarted 3 time(s) due to OOMKilled at unknown";
        f.cluster.emit(
            ResourceKind::Event,
            WatchSignal::Applied(event("p1.1", "monitoring", "OOMKilling", "Memory cgroup out of memory")),
        );
        assert!(wait_until(WAIT, || async { has(&f.notifier, oom) }).await);

        // A second kill makes the next scan observable; p1 is dispatched first
        f.cluster.set_objects(
            ResourceKind::Pod,
            vec![
                pod_with_termination("p1", "monitoring", "c1", "OOMKilled", 3),
                pod_with_termination("p2", "monitoring", "c2", "OOMKilled", 1),
            ],
        );
        f.cluster.emit(
            ResourceKind::Event,
            WatchSignal::Applied(event("p2.1", "monitoring", "OOMKilling", "Memory cgroup out of memory")),
        );
        let second = "Pod p2 Container c2 has been restarted 1 time(s) due to OOMKilled at unknown";
        assert!(wait_until(WAIT, || async { has(&f.notifier, second) }).await);

        let oom_count = f.notifier.sent().iter().filter(|s| s.as_str() == oom).count();
        assert_eq!(oom_count, 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_slow_delivery() {
        let f = fixture();
        f.cluster
            .set_objects(ResourceKind::Node, vec![node("worker-1", "1")]);
        f.notifier.set_delay(Duration::from_secs(25));
        let cancel = CancellationToken::new();

        let orchestrator = f.orchestrator.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { orchestrator.run(token).await });
        assert!(wait_until(WAIT, || async { f.health.readiness().await.ready }).await);
        assert!(wait_until(WAIT, || async { f.notifier.attempts() == 1 }).await);

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("teardown waited for the delivery")
            .unwrap();

        assert!(result.is_ok());
        assert!(f.notifier.sent().is_empty());
        assert!(f.cache.path().is_none());
        assert!(f.health.health().await.components.keys().all(|name| !name.starts_with("watch/")));
    }

    #[tokio::test]
    async fn test_inventory_failure_is_fatal_before_cache_init() {
        let f = fixture();
        f.cluster.fail_lists(true);

        let result = f.orchestrator.run(CancellationToken::new()).await;

        assert!(matches!(result, Err(OrchestratorError::Inventory(_))));
        assert!(f.cache.path().is_none());
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_session_start_failure_tears_down() {
        let f = fixture();
        f.cluster
            .set_objects(ResourceKind::Node, vec![node("worker-1", "1")]);
        f.cluster.fail_lists_of(ResourceKind::Event);

        let result = f.orchestrator.run(CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(OrchestratorError::Session(SessionError::InitialList { .. }))
        ));
        assert!(f.cache.path().is_none());
        assert!(!f.health.readiness().await.ready);
        assert_eq!(f.cluster.watch_count(ResourceKind::Pod), 0);
    }
}
