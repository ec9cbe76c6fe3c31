//! In-process [`StateStore`]
//!
//! Mirrors the API server semantics the reconciler relies on: resource
//! versions with conflict detection, AlreadyExists/NotFound, uids, strictly
//! increasing creation timestamps, owner-reference cascade and change events.
//! Pod status is only changed through the kubelet-style hooks
//! ([`MemoryStore::set_pod_phase`] and friends), never through `update`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodCondition, PodStatus, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{
    EventStream, EventType, ManagedObject, ObjectKind, StateStore, StoreError, StoreEvent,
};
use crate::crd::{StrataCluster, StrataClusterStatus};
use crate::labels::{managed_selector, LabelSelector};

const EVENT_BUFFER: usize = 1024;

/// Store operation that can be made to fail once
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailOp {
    /// `get` of the kind
    Get(ObjectKind),
    /// `list` of the kind
    List(ObjectKind),
    /// `create` of the kind
    Create(ObjectKind),
    /// `update` of the kind
    Update(ObjectKind),
    /// `delete` of the kind
    Delete(ObjectKind),
    /// `update_cluster_status`
    UpdateStatus,
}

type ObjectKey = (ObjectKind, String, String);

#[derive(Default)]
struct Inner {
    clusters: BTreeMap<(String, String), StrataCluster>,
    objects: BTreeMap<ObjectKey, ManagedObject>,
    version: u64,
    last_timestamp: Option<DateTime<Utc>>,
    failures: VecDeque<(FailOp, StoreError)>,
    writes: u64,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + chrono::Duration::milliseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn take_failure(&mut self, op: FailOp) -> Option<StoreError> {
        let idx = self.failures.iter().position(|(o, _)| *o == op)?;
        self.failures.remove(idx).map(|(_, err)| err)
    }
}

/// In-memory state store for tests and local simulation
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(kind: ObjectKind, name: &str) -> StoreError {
    StoreError::NotFound {
        kind,
        name: name.to_string(),
    }
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: ObjectKind, event_type: EventType, meta: &ObjectMeta) {
        // No subscribers is fine
        let _ = self
            .events
            .send(StoreEvent::from_meta(kind, event_type, meta));
    }

    /// Create or update a StrataCluster the way a user would
    ///
    /// Spec changes bump `metadata.generation`; status is never touched.
    pub fn apply_cluster(&self, mut cluster: StrataCluster) -> StrataCluster {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        let stored = {
            let mut inner = self.lock();
            let key = (namespace.clone(), name.clone());
            let version = inner.next_version();
            match inner.clusters.get(&key).cloned() {
                Some(existing) => {
                    let spec_changed = existing.spec != cluster.spec;
                    cluster.metadata.uid = existing.metadata.uid.clone();
                    cluster.metadata.creation_timestamp =
                        existing.metadata.creation_timestamp.clone();
                    cluster.metadata.generation = existing
                        .metadata
                        .generation
                        .map(|g| if spec_changed { g + 1 } else { g });
                    cluster.status = existing.status.clone();
                }
                None => {
                    cluster.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
                    cluster.metadata.creation_timestamp = Some(Time(inner.next_timestamp()));
                    cluster.metadata.generation = Some(1);
                }
            }
            cluster.metadata.namespace = Some(namespace);
            cluster.metadata.resource_version = Some(version);
            inner.clusters.insert(key, cluster.clone());
            cluster
        };
        self.emit(ObjectKind::Cluster, EventType::Applied, &stored.metadata);
        stored
    }

    /// Delete a StrataCluster and cascade to objects it owns
    pub fn delete_cluster(&self, namespace: &str, name: &str) -> bool {
        let (removed, cascaded) = {
            let mut inner = self.lock();
            let Some(cluster) = inner
                .clusters
                .remove(&(namespace.to_string(), name.to_string()))
            else {
                return false;
            };
            let uid = cluster.metadata.uid.clone();
            let owned: Vec<ObjectKey> = inner
                .objects
                .iter()
                .filter(|(_, obj)| {
                    obj.meta()
                        .owner_references
                        .iter()
                        .flatten()
                        .any(|r| Some(&r.uid) == uid.as_ref())
                })
                .map(|(k, _)| k.clone())
                .collect();
            let cascaded: Vec<ManagedObject> = owned
                .iter()
                .filter_map(|k| inner.objects.remove(k))
                .collect();
            (cluster, cascaded)
        };
        self.emit(ObjectKind::Cluster, EventType::Deleted, &removed.metadata);
        for obj in &cascaded {
            self.emit(obj.kind(), EventType::Deleted, obj.meta());
        }
        true
    }

    /// Current copy of a cluster
    pub fn cluster(&self, namespace: &str, name: &str) -> Option<StrataCluster> {
        self.lock()
            .clusters
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Overwrite a cluster's status directly (simulates a restored or hand-edited status)
    pub fn set_cluster_status(&self, namespace: &str, name: &str, status: StrataClusterStatus) {
        let mut inner = self.lock();
        let version = inner.next_version();
        if let Some(cluster) = inner
            .clusters
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            cluster.status = Some(status);
            cluster.metadata.resource_version = Some(version);
        }
    }

    /// All objects of a kind in a namespace, ordered by name
    pub fn objects(&self, kind: ObjectKind, namespace: &str) -> Vec<ManagedObject> {
        self.lock()
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    /// All pods in a namespace, ordered by name
    pub fn pods(&self, namespace: &str) -> Vec<Pod> {
        self.objects(ObjectKind::Pod, namespace)
            .into_iter()
            .filter_map(|o| o.as_pod().cloned())
            .collect()
    }

    /// All services in a namespace, ordered by name
    pub fn services(&self, namespace: &str) -> Vec<Service> {
        self.objects(ObjectKind::Service, namespace)
            .into_iter()
            .filter_map(|o| o.as_service().cloned())
            .collect()
    }

    /// One pod by name
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.lock()
            .objects
            .get(&(ObjectKind::Pod, namespace.to_string(), name.to_string()))
            .and_then(|o| o.as_pod().cloned())
    }

    /// One service by name
    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.lock()
            .objects
            .get(&(ObjectKind::Service, namespace.to_string(), name.to_string()))
            .and_then(|o| o.as_service().cloned())
    }

    /// Make the next matching operation fail with `err`
    pub fn fail_next(&self, op: FailOp, err: StoreError) {
        self.lock().failures.push_back((op, err));
    }

    /// Successful writes made through the [`StateStore`] API
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    fn mutate_pod_status(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut PodStatus),
    ) -> Result<(), StoreError> {
        let meta = {
            let mut inner = self.lock();
            let version = inner.next_version();
            let key = (ObjectKind::Pod, namespace.to_string(), name.to_string());
            let Some(ManagedObject::Pod(pod)) = inner.objects.get_mut(&key) else {
                return Err(not_found(ObjectKind::Pod, name));
            };
            f(pod.status.get_or_insert_with(PodStatus::default));
            pod.metadata.resource_version = Some(version);
            pod.metadata.clone()
        };
        self.emit(ObjectKind::Pod, EventType::Applied, &meta);
        Ok(())
    }

    /// Set a pod's phase
    pub fn set_pod_phase(&self, namespace: &str, name: &str, phase: &str) -> Result<(), StoreError> {
        self.mutate_pod_status(namespace, name, |status| {
            status.phase = Some(phase.to_string());
        })
    }

    /// Set a pod's Ready condition
    pub fn set_pod_ready(&self, namespace: &str, name: &str, ready: bool) -> Result<(), StoreError> {
        self.mutate_pod_status(namespace, name, |status| {
            let conditions = status.conditions.get_or_insert_with(Vec::new);
            conditions.retain(|c| c.type_ != "Ready");
            conditions.push(PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            });
        })
    }

    /// Set the restart count of a pod's first container
    pub fn set_pod_restarts(
        &self,
        namespace: &str,
        name: &str,
        restarts: i32,
    ) -> Result<(), StoreError> {
        self.mutate_pod_status(namespace, name, |status| {
            let statuses = status.container_statuses.get_or_insert_with(Vec::new);
            match statuses.first_mut() {
                Some(cs) => cs.restart_count = restarts,
                None => statuses.push(ContainerStatus {
                    name: "main".to_string(),
                    restart_count: restarts,
                    ..Default::default()
                }),
            }
        })
    }

    /// Mark a pod Running and Ready
    pub fn start_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.set_pod_phase(namespace, name, "Running")?;
        self.set_pod_ready(namespace, name, true)
    }

    /// Mark every pod in the namespace Running and Ready; returns how many were started
    pub fn start_all_pods(&self, namespace: &str) -> usize {
        let names: Vec<String> = self
            .pods(namespace)
            .into_iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .filter_map(|p| p.metadata.name)
            .collect();
        names
            .iter()
            .filter(|name| self.start_pod(namespace, name).is_ok())
            .count()
    }

    /// Set a deletion timestamp as if graceful termination had started
    pub fn mark_terminating(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let ts = inner.next_timestamp();
        let version = inner.next_version();
        let key = (ObjectKind::Pod, namespace.to_string(), name.to_string());
        let Some(obj) = inner.objects.get_mut(&key) else {
            return Err(not_found(ObjectKind::Pod, name));
        };
        obj.meta_mut().deletion_timestamp = Some(Time(ts));
        obj.meta_mut().resource_version = Some(version);
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StrataCluster>, StoreError> {
        let mut inner = self.lock();
        if let Some(err) = inner.take_failure(FailOp::Get(ObjectKind::Cluster)) {
            return Err(err);
        }
        Ok(inner
            .clusters
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_clusters(
        &self,
        namespace: Option<String>,
    ) -> Result<Vec<StrataCluster>, StoreError> {
        let mut inner = self.lock();
        if let Some(err) = inner.take_failure(FailOp::List(ObjectKind::Cluster)) {
            return Err(err);
        }
        Ok(inner
            .clusters
            .iter()
            .filter(|((ns, _), _)| namespace.as_ref().map_or(true, |want| want == ns))
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn update_cluster_status(
        &self,
        cluster: &StrataCluster,
        status: &StrataClusterStatus,
    ) -> Result<StrataCluster, StoreError> {
        let name = cluster.name_any();
        let updated = {
            let mut inner = self.lock();
            if let Some(err) = inner.take_failure(FailOp::UpdateStatus) {
                return Err(err);
            }
            let version = inner.next_version();
            let key = (cluster.namespace().unwrap_or_default(), name.clone());
            let Some(stored) = inner.clusters.get_mut(&key) else {
                return Err(not_found(ObjectKind::Cluster, &name));
            };
            if cluster.metadata.resource_version.is_some()
                && cluster.metadata.resource_version != stored.metadata.resource_version
            {
                return Err(StoreError::Conflict {
                    kind: ObjectKind::Cluster,
                    name,
                    message: "resource version is stale".to_string(),
                });
            }
            stored.status = Some(status.clone());
            stored.metadata.resource_version = Some(version);
            let updated = stored.clone();
            inner.writes += 1;
            updated
        };
        self.emit(ObjectKind::Cluster, EventType::Applied, &updated.metadata);
        Ok(updated)
    }

    async fn get(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedObject>, StoreError> {
        let mut inner = self.lock();
        if let Some(err) = inner.take_failure(FailOp::Get(kind)) {
            return Err(err);
        }
        Ok(inner
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ManagedObject>, StoreError> {
        let mut inner = self.lock();
        if let Some(err) = inner.take_failure(FailOp::List(kind)) {
            return Err(err);
        }
        Ok(inner
            .objects
            .iter()
            .filter(|((k, ns, _), obj)| {
                *k == kind
                    && ns == namespace
                    && selector.matches(obj.meta().labels.as_ref().unwrap_or(&BTreeMap::new()))
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject, StoreError> {
        let kind = object.kind();
        let name = object.name().to_string();
        let created = {
            let mut inner = self.lock();
            if let Some(err) = inner.take_failure(FailOp::Create(kind)) {
                return Err(err);
            }
            let key = (kind, object.namespace().to_string(), name.clone());
            if inner.objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists { kind, name });
            }
            let mut created = object.clone();
            let ts = inner.next_timestamp();
            let version = inner.next_version();
            let meta = created.meta_mut();
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
            meta.creation_timestamp = Some(Time(ts));
            meta.resource_version = Some(version);
            meta.deletion_timestamp = None;
            if let ManagedObject::Pod(pod) = &mut created {
                pod.status = Some(PodStatus {
                    phase: Some("Pending".to_string()),
                    ..Default::default()
                });
            }
            inner.objects.insert(key, created.clone());
            inner.writes += 1;
            created
        };
        self.emit(kind, EventType::Applied, created.meta());
        Ok(created)
    }

    async fn update(&self, object: &ManagedObject) -> Result<ManagedObject, StoreError> {
        let kind = object.kind();
        let name = object.name().to_string();
        let updated = {
            let mut inner = self.lock();
            if let Some(err) = inner.take_failure(FailOp::Update(kind)) {
                return Err(err);
            }
            let version = inner.next_version();
            let key = (kind, object.namespace().to_string(), name.clone());
            let Some(stored) = inner.objects.get_mut(&key) else {
                return Err(not_found(kind, &name));
            };
            if object.resource_version().is_some()
                && object.resource_version() != stored.resource_version()
            {
                return Err(StoreError::Conflict {
                    kind,
                    name,
                    message: "resource version is stale".to_string(),
                });
            }
            let mut next = object.clone();
            {
                let prev = stored.meta();
                let uid = prev.uid.clone();
                let created = prev.creation_timestamp.clone();
                let deleting = prev.deletion_timestamp.clone();
                let meta = next.meta_mut();
                meta.uid = uid;
                meta.creation_timestamp = created;
                meta.deletion_timestamp = deleting;
                meta.resource_version = Some(version);
            }
            match (&mut next, &*stored) {
                (ManagedObject::Pod(new), ManagedObject::Pod(old)) => {
                    new.status = old.status.clone();
                }
                (ManagedObject::Service(new), ManagedObject::Service(old)) => {
                    new.status = old.status.clone();
                }
                _ => {}
            }
            *stored = next.clone();
            inner.writes += 1;
            next
        };
        self.emit(kind, EventType::Applied, updated.meta());
        Ok(updated)
    }

    async fn delete(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let removed = {
            let mut inner = self.lock();
            if let Some(err) = inner.take_failure(FailOp::Delete(kind)) {
                return Err(err);
            }
            let removed = inner
                .objects
                .remove(&(kind, namespace.to_string(), name.to_string()))
                .ok_or_else(|| not_found(kind, name))?;
            inner.writes += 1;
            removed
        };
        self.emit(kind, EventType::Deleted, removed.meta());
        Ok(())
    }

    fn watch(&self, kind: ObjectKind, namespace: Option<String>) -> EventStream {
        let managed = managed_selector();
        BroadcastStream::new(self.events.subscribe())
            .filter_map(move |item| {
                let mapped = match item {
                    Ok(event) => {
                        let in_scope = event.kind == kind
                            && namespace.as_ref().map_or(true, |ns| *ns == event.namespace)
                            && (kind == ObjectKind::Cluster || managed.matches(&event.labels));
                        in_scope.then_some(Ok(event))
                    }
                    Err(lagged) => Some(Err(StoreError::Transient {
                        message: format!("{kind} watch: {lagged}"),
                    })),
                };
                future::ready(mapped)
            })
            .boxed()
    }
}
