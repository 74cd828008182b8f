//! Test doubles for the cluster capability and the notification sink

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Event, Node, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::cluster::{ChangeStream, ClusterClient, WatchSignal};
use crate::error::{ClusterError, NotifyError};
use crate::models::{ClusterObject, NamespaceScope, Notification, ResourceKind};
use crate::notifier::Notifier;

type WatchSender = mpsc::UnboundedSender<Result<WatchSignal, ClusterError>>;

/// In-memory cluster serving lists and scripted watch streams
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<HashMap<ResourceKind, Vec<ClusterObject>>>,
    watchers: Mutex<Vec<(ResourceKind, NamespaceScope, WatchSender)>>,
    fail_lists: AtomicBool,
    failing_kinds: Mutex<HashSet<ResourceKind>>,
    list_calls: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_objects(&self, kind: ResourceKind, objects: Vec<ClusterObject>) {
        self.objects.lock().unwrap().insert(kind, objects);
    }

    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    /// Fail lists of one kind only
    pub fn fail_lists_of(&self, kind: ResourceKind) {
        self.failing_kinds.lock().unwrap().insert(kind);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_count(&self, kind: ResourceKind) -> usize {
        self.watchers
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _, tx)| *k == kind && !tx.is_closed())
            .count()
    }

    /// Push a signal to every open watch of `kind` whose scope covers the object
    pub fn emit(&self, kind: ResourceKind, signal: WatchSignal) {
        let namespace = match &signal {
            WatchSignal::Applied(obj) | WatchSignal::Deleted(obj) => obj.namespace(),
            WatchSignal::Relisted(_) => None,
        };
        for (k, scope, tx) in self.watchers.lock().unwrap().iter() {
            if *k == kind && scope.contains(namespace.as_deref()) {
                let _ = tx.send(Ok(signal.clone()));
            }
        }
    }

    pub fn emit_error(&self, kind: ResourceKind) {
        for (k, _, tx) in self.watchers.lock().unwrap().iter() {
            if *k == kind {
                let _ = tx.send(Err(ClusterError::Watch {
                    kind,
                    message: "connection reset".to_string(),
                }));
            }
        }
    }

    /// End every open watch stream of `kind`
    pub fn close_watches(&self, kind: ResourceKind) {
        self.watchers.lock().unwrap().retain(|(k, _, _)| *k != kind);
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list(
        &self,
        kind: ResourceKind,
        scope: &NamespaceScope,
    ) -> Result<Vec<ClusterObject>, ClusterError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_lists.load(Ordering::SeqCst)
            || self.failing_kinds.lock().unwrap().contains(&kind)
        {
            return Err(ClusterError::List {
                kind,
                scope: scope.clone(),
                message: "forbidden".to_string(),
            });
        }

        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&kind)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|obj| scope.contains(obj.namespace().as_deref()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn watch(&self, kind: ResourceKind, scope: &NamespaceScope) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().unwrap().push((kind, scope.clone(), tx));
        UnboundedReceiverStream::new(rx).boxed()
    }
}

/// Notifier that records what it was asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.text.clone())
            .collect()
    }

    /// Hold every publish for `delay` before answering
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Transport {
                destination: notification.destination.to_string(),
                message: "connection refused".to_string(),
            });
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

fn meta(name: &str, namespace: Option<&str>, resource_version: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        resource_version: Some(resource_version.to_string()),
        ..Default::default()
    }
}

pub fn pod(name: &str, namespace: &str, resource_version: &str) -> ClusterObject {
    ClusterObject::Pod(Pod {
        metadata: meta(name, Some(namespace), resource_version),
        ..Default::default()
    })
}

pub fn node(name: &str, resource_version: &str) -> ClusterObject {
    ClusterObject::Node(Node {
        metadata: meta(name, None, resource_version),
        ..Default::default()
    })
}

pub fn event(name: &str, namespace: &str, reason: &str, message: &str) -> ClusterObject {
    ClusterObject::Event(Event {
        metadata: meta(name, Some(namespace), "1"),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        ..Default::default()
    })
}

/// Pod with one container whose last termination had `reason`
pub fn pod_with_termination(
    name: &str,
    namespace: &str,
    container: &str,
    reason: &str,
    restart_count: i32,
) -> ClusterObject {
    ClusterObject::Pod(Pod {
        metadata: meta(name, Some(namespace), "1"),
        status: Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: container.to_string(),
                restart_count,
                last_state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        reason: Some(reason.to_string()),
                        exit_code: 137,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
