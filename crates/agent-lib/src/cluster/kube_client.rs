//! Kubernetes API implementation of the cluster capability

use std::fmt::Debug;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Config, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::{ChangeStream, ClusterClient, WatchSignal};
use crate::error::ClusterError;
use crate::models::{ClusterObject, NamespaceScope, ResourceKind};

/// How cluster credentials are resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMode {
    /// Service account mounted into the pod
    InCluster,
    /// Kubeconfig file; `None` lets the client infer the usual locations
    Kubeconfig(Option<PathBuf>),
}

/// Cluster client backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Resolve credentials and build a client
    pub async fn connect(mode: &ConnectMode) -> Result<Self, ClusterError> {
        let config = match mode {
            ConnectMode::InCluster => {
                Config::incluster().map_err(|e| ClusterError::Connect(e.to_string()))?
            }
            ConnectMode::Kubeconfig(Some(path)) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ClusterError::Connect(format!("reading {}: {}", path.display(), e))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| ClusterError::Connect(e.to_string()))?
            }
            ConnectMode::Kubeconfig(None) => Config::infer()
                .await
                .map_err(|e| ClusterError::Connect(e.to_string()))?,
        };

        info!(cluster_url = %config.cluster_url, mode = ?mode, "Resolved cluster configuration");

        let client = Client::try_from(config).map_err(|e| ClusterError::Connect(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn scoped_api<K>(&self, scope: &NamespaceScope) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match scope {
            NamespaceScope::All => Api::all(self.client.clone()),
            NamespaceScope::Namespace(ns) => Api::namespaced(self.client.clone(), ns),
        }
    }
}

async fn list_objects<K>(
    api: Api<K>,
    kind: ResourceKind,
    scope: &NamespaceScope,
    wrap: fn(K) -> ClusterObject,
) -> Result<Vec<ClusterObject>, ClusterError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let list = api
        .list(&ListParams::default())
        .await
        .map_err(|e| ClusterError::List {
            kind,
            scope: scope.clone(),
            message: e.to_string(),
        })?;

    debug!(kind = %kind, scope = %scope, count = list.items.len(), "Listed resources");
    Ok(list.items.into_iter().map(wrap).collect())
}

fn watch_objects<K>(api: Api<K>, kind: ResourceKind, wrap: fn(K) -> ClusterObject) -> ChangeStream
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher(api, watcher::Config::default())
        .default_backoff()
        .map(move |event| match event {
            Ok(watcher::Event::Applied(obj)) => Ok(WatchSignal::Applied(wrap(obj))),
            Ok(watcher::Event::Deleted(obj)) => Ok(WatchSignal::Deleted(wrap(obj))),
            Ok(watcher::Event::Restarted(objs)) => {
                Ok(WatchSignal::Relisted(objs.into_iter().map(wrap).collect()))
            }
            Err(e) => Err(ClusterError::Watch {
                kind,
                message: e.to_string(),
            }),
        })
        .boxed()
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list(
        &self,
        kind: ResourceKind,
        scope: &NamespaceScope,
    ) -> Result<Vec<ClusterObject>, ClusterError> {
        match kind {
            ResourceKind::Pod => {
                list_objects(self.scoped_api::<Pod>(scope), kind, scope, ClusterObject::Pod).await
            }
            ResourceKind::Event => {
                list_objects(self.scoped_api::<Event>(scope), kind, scope, ClusterObject::Event)
                    .await
            }
            ResourceKind::Node => {
                let api: Api<Node> = Api::all(self.client.clone());
                list_objects(api, kind, scope, ClusterObject::Node).await
            }
        }
    }

    fn watch(&self, kind: ResourceKind, scope: &NamespaceScope) -> ChangeStream {
        match kind {
            ResourceKind::Pod => watch_objects(self.scoped_api::<Pod>(scope), kind, ClusterObject::Pod),
            ResourceKind::Event => {
                watch_objects(self.scoped_api::<Event>(scope), kind, ClusterObject::Event)
            }
            ResourceKind::Node => {
                watch_objects(Api::<Node>::all(self.client.clone()), kind, ClusterObject::Node)
            }
        }
    }
}
