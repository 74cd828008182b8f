//! Watch session task

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ObjectStore, WatchSessionSpec};
use crate::cluster::ClusterClient;
use crate::error::SessionError;
use crate::health::HealthRegistry;
use crate::models::{ClusterObject, ResourceChangeEvent};
use crate::observability::AgentMetrics;

/// Pause before reopening a change stream that ended
const STREAM_RESTART_DELAY: Duration = Duration::from_secs(1);

/// A running session's task
pub struct WatchSessionHandle {
    name: String,
    task: JoinHandle<()>,
}

impl WatchSessionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the session task to stop
    pub async fn join(self) -> Result<(), JoinError> {
        self.task.await
    }

    /// Handle that stops the task without waiting for a cancellation point
    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }
}

/// Long-lived subscription to one resource collection
pub struct WatchSession {
    spec: WatchSessionSpec,
    client: Arc<dyn ClusterClient>,
    store: ObjectStore,
    health: HealthRegistry,
    metrics: AgentMetrics,
    cancel: CancellationToken,
}

impl WatchSession {
    /// Perform the initial list and spawn the session task.
    ///
    /// A failed initial list is returned to the caller and not retried.
    pub async fn start(
        spec: WatchSessionSpec,
        client: Arc<dyn ClusterClient>,
        health: HealthRegistry,
        metrics: AgentMetrics,
        cancel: CancellationToken,
    ) -> Result<WatchSessionHandle, SessionError> {
        spec.validate()?;

        let initial = client
            .list(spec.kind, &spec.scope)
            .await
            .map_err(|source| SessionError::InitialList {
                name: spec.name.clone(),
                source,
            })?;

        health.register(&spec.name).await;
        info!(
            session = %spec.name,
            kind = %spec.kind,
            scope = %spec.scope,
            resync_secs = spec.resync_interval.as_secs(),
            objects = initial.len(),
            update_handler = spec.handlers.on_update.is_present(),
            "Watch session started"
        );

        let name = spec.name.clone();
        let session = Self {
            spec,
            client,
            store: ObjectStore::new(),
            health,
            metrics,
            cancel,
        };
        let task = tokio::spawn(session.run(initial));

        Ok(WatchSessionHandle { name, task })
    }

    async fn run(mut self, initial: Vec<ClusterObject>) {
        self.metrics.inc_active_sessions();

        let changes = self.store.replace(initial);
        self.dispatch(changes).await;

        let period = self.spec.resync_interval;
        let mut resync = interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stream = self.client.watch(self.spec.kind, &self.spec.scope);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                _ = resync.tick() => {
                    debug!(session = %self.spec.name, "Periodic resync");
                    self.resync().await;
                }

                next = stream.next() => match next {
                    Some(Ok(signal)) => {
                        let changes = self.store.apply(signal);
                        self.dispatch(changes).await;
                    }
                    Some(Err(e)) => {
                        warn!(session = %self.spec.name, error = %e, "Change stream error");
                        self.metrics.inc_watch_errors();
                        self.health.set_degraded(&self.spec.name, e.to_string()).await;
                    }
                    None => {
                        warn!(session = %self.spec.name, "Change stream ended, re-listing");
                        self.resync().await;

                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(STREAM_RESTART_DELAY) => {}
                        }
                        stream = self.client.watch(self.spec.kind, &self.spec.scope);
                        resync.reset();
                    }
                },
            }
        }

        self.metrics.dec_active_sessions();
        info!(session = %self.spec.name, "Watch session stopped");
    }

    /// Re-list the collection and report the difference to the handlers.
    /// A failed re-list leaves the store untouched.
    async fn resync(&mut self) {
        let listed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            listed = self.client.list(self.spec.kind, &self.spec.scope) => listed,
        };

        match listed {
            Ok(objects) => {
                let changes = self.store.replace(objects);
                debug!(
                    session = %self.spec.name,
                    changes = changes.len(),
                    objects = self.store.len(),
                    "Resync complete"
                );
                self.health.set_healthy(&self.spec.name).await;
                self.dispatch(changes).await;
            }
            Err(e) => {
                warn!(session = %self.spec.name, error = %e, "Resync list failed");
                self.metrics.inc_watch_errors();
                self.health.set_degraded(&self.spec.name, e.to_string()).await;
            }
        }
    }

    /// Hand each change to the handlers. Cancellation abandons the handler
    /// in progress and skips the remaining changes.
    async fn dispatch(&self, changes: Vec<ResourceChangeEvent>) {
        for change in &changes {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(session = %self.spec.name, "Dispatch interrupted by cancellation");
                    return;
                }
                _ = self.spec.handlers.dispatch(change) => {}
            }
        }
    }
}
