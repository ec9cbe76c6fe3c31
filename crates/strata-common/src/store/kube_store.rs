//! [`StateStore`] backed by the Kubernetes API

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    EventStream, EventType, ManagedObject, ObjectKind, StateStore, StoreError, StoreEvent,
};
use crate::crd::{StrataCluster, StrataClusterStatus};
use crate::labels::{managed_selector, LabelSelector};
use crate::FIELD_MANAGER;

/// Kubernetes-backed state store
///
/// Every call is bounded by the store timeout; a call that exceeds it fails
/// with [`StoreError::Timeout`] and is retried by the caller's normal backoff.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    timeout: Duration,
}

impl KubeStore {
    /// Create a store over `client` with a per-call deadline
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn call<T>(
        &self,
        kind: ObjectKind,
        name: &str,
        request: impl Future<Output = Result<T, kube::Error>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(|e| StoreError::from_kube(kind, name, e)),
            Err(_) => Err(StoreError::Timeout {
                kind,
                name: name.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

/// Body for a status PUT
///
/// The whole status replaces the stored one, so keys dropped from maps are
/// removed. The resourceVersion makes the write conditional.
fn status_body(
    cluster: &StrataCluster,
    status: &StrataClusterStatus,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut object = cluster.clone();
    object.status = Some(status.clone());
    serde_json::to_vec(&object)
}

/// Translate a kube watcher stream into store events
fn watch_events<K>(api: Api<K>, kind: ObjectKind, config: watcher::Config) -> EventStream
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    watcher::watcher(api, config)
        .default_backoff()
        .filter_map(move |event| {
            let mapped = match event {
                Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => Some(Ok(
                    StoreEvent::from_meta(kind, EventType::Applied, obj.meta()),
                )),
                Ok(Event::Delete(obj)) => Some(Ok(StoreEvent::from_meta(
                    kind,
                    EventType::Deleted,
                    obj.meta(),
                ))),
                Ok(Event::Init) | Ok(Event::InitDone) => None,
                Err(e) => Some(Err(StoreError::Transient {
                    message: format!("{kind} watch: {e}"),
                })),
            };
            future::ready(mapped)
        })
        .boxed()
}

#[async_trait]
impl StateStore for KubeStore {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StrataCluster>, StoreError> {
        let api: Api<StrataCluster> = self.api(Some(namespace));
        self.call(ObjectKind::Cluster, name, api.get_opt(name)).await
    }

    async fn list_clusters(
        &self,
        namespace: Option<String>,
    ) -> Result<Vec<StrataCluster>, StoreError> {
        let api: Api<StrataCluster> = self.api(namespace.as_deref());
        let list = self
            .call(ObjectKind::Cluster, "*", api.list(&ListParams::default()))
            .await?;
        Ok(list.items)
    }

    async fn update_cluster_status(
        &self,
        cluster: &StrataCluster,
        status: &StrataClusterStatus,
    ) -> Result<StrataCluster, StoreError> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();
        let api: Api<StrataCluster> = self.api(Some(&namespace));
        let body = status_body(cluster, status).map_err(|e| StoreError::Rejected {
            kind: ObjectKind::Cluster,
            name: name.clone(),
            message: format!("failed to serialize status: {e}"),
        })?;

        debug!(cluster = %name, "Writing status");
        self.call(
            ObjectKind::Cluster,
            &name,
            api.replace_status(&name, &Self::post_params(), body),
        )
        .await
    }

    async fn get(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedObject>, StoreError> {
        match kind {
            ObjectKind::Pod => {
                let api: Api<Pod> = self.api(Some(namespace));
                let pod = self.call(kind, name, api.get_opt(name)).await?;
                Ok(pod.map(ManagedObject::Pod))
            }
            ObjectKind::Service => {
                let api: Api<Service> = self.api(Some(namespace));
                let svc = self.call(kind, name, api.get_opt(name)).await?;
                Ok(svc.map(ManagedObject::Service))
            }
            ObjectKind::Cluster => Err(StoreError::Rejected {
                kind,
                name: name.to_string(),
                message: "use get_cluster for StrataCluster".to_string(),
            }),
        }
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ManagedObject>, StoreError> {
        let params = ListParams::default().labels(&selector.to_string());
        let query = selector.to_string();
        match kind {
            ObjectKind::Pod => {
                let api: Api<Pod> = self.api(Some(namespace));
                let list = self.call(kind, &query, api.list(&params)).await?;
                Ok(list.items.into_iter().map(ManagedObject::Pod).collect())
            }
            ObjectKind::Service => {
                let api: Api<Service> = self.api(Some(namespace));
                let list = self.call(kind, &query, api.list(&params)).await?;
                Ok(list.items.into_iter().map(ManagedObject::Service).collect())
            }
            ObjectKind::Cluster => Err(StoreError::Rejected {
                kind,
                name: query,
                message: "use list_clusters for StrataCluster".to_string(),
            }),
        }
    }

    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject, StoreError> {
        let name = object.name().to_string();
        let namespace = object.namespace().to_string();
        match object {
            ManagedObject::Pod(pod) => {
                let api: Api<Pod> = self.api(Some(&namespace));
                let created = self
                    .call(ObjectKind::Pod, &name, api.create(&Self::post_params(), pod))
                    .await?;
                Ok(ManagedObject::Pod(created))
            }
            ManagedObject::Service(svc) => {
                let api: Api<Service> = self.api(Some(&namespace));
                let created = self
                    .call(
                        ObjectKind::Service,
                        &name,
                        api.create(&Self::post_params(), svc),
                    )
                    .await?;
                Ok(ManagedObject::Service(created))
            }
        }
    }

    async fn update(&self, object: &ManagedObject) -> Result<ManagedObject, StoreError> {
        let name = object.name().to_string();
        let namespace = object.namespace().to_string();
        match object {
            ManagedObject::Pod(pod) => {
                let api: Api<Pod> = self.api(Some(&namespace));
                let updated = self
                    .call(
                        ObjectKind::Pod,
                        &name,
                        api.replace(&name, &Self::post_params(), pod),
                    )
                    .await?;
                Ok(ManagedObject::Pod(updated))
            }
            ManagedObject::Service(svc) => {
                let api: Api<Service> = self.api(Some(&namespace));
                let updated = self
                    .call(
                        ObjectKind::Service,
                        &name,
                        api.replace(&name, &Self::post_params(), svc),
                    )
                    .await?;
                Ok(ManagedObject::Service(updated))
            }
        }
    }

    async fn delete(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let params = DeleteParams::background();
        match kind {
            ObjectKind::Pod => {
                let api: Api<Pod> = self.api(Some(namespace));
                self.call(kind, name, api.delete(name, &params)).await?;
            }
            ObjectKind::Service => {
                let api: Api<Service> = self.api(Some(namespace));
                self.call(kind, name, api.delete(name, &params)).await?;
            }
            ObjectKind::Cluster => {
                return Err(StoreError::Rejected {
                    kind,
                    name: name.to_string(),
                    message: "StrataClusters are deleted by their owners".to_string(),
                })
            }
        }
        Ok(())
    }

    fn watch(&self, kind: ObjectKind, namespace: Option<String>) -> EventStream {
        let managed = watcher::Config::default().labels(&managed_selector().to_string());
        match kind {
            ObjectKind::Cluster => watch_events(
                self.api::<StrataCluster>(namespace.as_deref()),
                kind,
                watcher::Config::default(),
            ),
            ObjectKind::Pod => watch_events(self.api::<Pod>(namespace.as_deref()), kind, managed),
            ObjectKind::Service => {
                watch_events(self.api::<Service>(namespace.as_deref()), kind, managed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::crd::{
        ContainerTemplate, GenerationRecord, GenerationSpec, StrataClusterSpec, WorkerGroupStatus,
    };

    fn template(env: &[(&str, &str)]) -> ContainerTemplate {
        ContainerTemplate {
            image: "runtime:1".into(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn status(env: &[(&str, &str)], groups: &[&str]) -> StrataClusterStatus {
        let mut status = StrataClusterStatus::default();
        status.set_active(Some(GenerationRecord {
            id: "train-g0".into(),
            number: 0,
            rollout_hash: "h".into(),
            spec: GenerationSpec {
                head_template: template(env),
                worker_groups: vec![],
            },
            created_at: Utc::now(),
            ready_at: None,
            head_started_at: None,
        }));
        status.worker_groups = groups
            .iter()
            .map(|g| (g.to_string(), WorkerGroupStatus::default()))
            .collect::<BTreeMap<_, _>>();
        status
    }

    fn stored_cluster() -> StrataCluster {
        let mut cluster = StrataCluster::new(
            "train",
            StrataClusterSpec {
                head_template: template(&[]),
                worker_groups: vec![],
                upgrade_strategy: None,
                suspend: false,
            },
        );
        cluster.metadata.namespace = Some("ml".into());
        cluster.metadata.resource_version = Some("42".into());
        cluster.status = Some(status(&[("OLD", "1")], &["a", "b"]));
        cluster
    }

    #[test]
    fn status_body_replaces_stored_status() {
        let cluster = stored_cluster();
        let next = status(&[], &["b"]);

        let body = status_body(&cluster, &next).unwrap();
        let written: StrataCluster = serde_json::from_slice(&body).unwrap();

        assert_eq!(written.status, Some(next));
        let raw: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(raw["status"]["workerGroups"].get("a").is_none());
        assert!(raw["status"]["activeGeneration"]["spec"]["headTemplate"]
            .get("env")
            .is_none());
    }

    #[test]
    fn status_body_carries_resource_version() {
        let cluster = stored_cluster();
        let body = status_body(&cluster, &StrataClusterStatus::default()).unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(raw["metadata"]["resourceVersion"], "42");
    }
}
