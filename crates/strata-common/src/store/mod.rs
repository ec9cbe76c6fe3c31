//! State store client
//!
//! The reconciler only talks to the cluster state through [`StateStore`]: a
//! typed key-value API with optimistic concurrency (every update carries the
//! resource version it was computed from) and change subscriptions.
//!
//! [`KubeStore`] is the production implementation on kube-rs. [`MemoryStore`]
//! is an in-process implementation with the same semantics, used for tests and
//! local simulation.

mod kube_store;
mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

use crate::crd::{StrataCluster, StrataClusterStatus};
use crate::labels::LabelSelector;

pub use self::kube_store::KubeStore;
pub use self::memory::{FailOp, MemoryStore};

/// Kinds of object the operator reads and writes
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    /// The StrataCluster resource itself
    Cluster,
    /// A head or worker pod
    Pod,
    /// A head or serving service
    Service,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Cluster => f.write_str("StrataCluster"),
            ObjectKind::Pod => f.write_str("Pod"),
            ObjectKind::Service => f.write_str("Service"),
        }
    }
}

/// Classified failure of a store call
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Object kind
        kind: ObjectKind,
        /// Object name
        name: String,
    },

    /// Create of an object that already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Object kind
        kind: ObjectKind,
        /// Object name
        name: String,
    },

    /// Write based on a stale resource version
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        /// Object kind
        kind: ObjectKind,
        /// Object name
        name: String,
        /// Server message
        message: String,
    },

    /// Request refused and will keep being refused (invalid, forbidden)
    #[error("{kind} {name} rejected: {message}")]
    Rejected {
        /// Object kind
        kind: ObjectKind,
        /// Object name
        name: String,
        /// Server message
        message: String,
    },

    /// Call did not finish within the store deadline
    #[error("{kind} {name}: store call timed out after {timeout:?}")]
    Timeout {
        /// Object kind
        kind: ObjectKind,
        /// Object name (or selector for lists)
        name: String,
        /// Deadline that expired
        timeout: Duration,
    },

    /// Anything else (network, 5xx, watch failures)
    #[error("transient store error: {message}")]
    Transient {
        /// Description of what failed
        message: String,
    },
}

impl StoreError {
    /// Classify a kube-rs error for the given object
    pub fn from_kube(kind: ObjectKind, name: &str, err: ::kube::Error) -> Self {
        match err {
            ::kube::Error::Api(resp) => match resp.code {
                409 if resp.reason == "AlreadyExists" => StoreError::AlreadyExists {
                    kind,
                    name: name.to_string(),
                },
                409 => StoreError::Conflict {
                    kind,
                    name: name.to_string(),
                    message: resp.message,
                },
                404 => StoreError::NotFound {
                    kind,
                    name: name.to_string(),
                },
                400 | 403 | 422 => StoreError::Rejected {
                    kind,
                    name: name.to_string(),
                    message: resp.message,
                },
                _ => StoreError::Transient {
                    message: format!("{kind} {name}: {} ({})", resp.message, resp.code),
                },
            },
            other => StoreError::Transient {
                message: format!("{kind} {name}: {other}"),
            },
        }
    }

    /// Stale resource version
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Object absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Create raced with an existing object
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    /// Whether a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Rejected { .. })
    }
}

/// A sub-resource the operator manages
#[derive(Clone, Debug, PartialEq)]
pub enum ManagedObject {
    /// Head or worker pod
    Pod(Pod),
    /// Head or serving service
    Service(Service),
}

impl ManagedObject {
    /// Kind of this object
    pub fn kind(&self) -> ObjectKind {
        match self {
            ManagedObject::Pod(_) => ObjectKind::Pod,
            ManagedObject::Service(_) => ObjectKind::Service,
        }
    }

    /// Object metadata
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ManagedObject::Pod(p) => &p.metadata,
            ManagedObject::Service(s) => &s.metadata,
        }
    }

    /// Mutable object metadata
    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ManagedObject::Pod(p) => &mut p.metadata,
            ManagedObject::Service(s) => &mut s.metadata,
        }
    }

    /// Object name (empty if unset)
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// Object namespace (empty if unset)
    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    /// Label value, if present
    pub fn label(&self, key: &str) -> Option<&str> {
        self.meta()
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    /// Annotation value, if present
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Resource version the object was read at
    pub fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    /// Borrow as a pod
    pub fn as_pod(&self) -> Option<&Pod> {
        match self {
            ManagedObject::Pod(p) => Some(p),
            ManagedObject::Service(_) => None,
        }
    }

    /// Borrow as a service
    pub fn as_service(&self) -> Option<&Service> {
        match self {
            ManagedObject::Service(s) => Some(s),
            ManagedObject::Pod(_) => None,
        }
    }
}

impl From<Pod> for ManagedObject {
    fn from(pod: Pod) -> Self {
        ManagedObject::Pod(pod)
    }
}

impl From<Service> for ManagedObject {
    fn from(service: Service) -> Self {
        ManagedObject::Service(service)
    }
}

/// What happened to an object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Created or modified (also emitted for every object on (re)list)
    Applied,
    /// Removed
    Deleted,
}

/// A change notification from [`StateStore::watch`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreEvent {
    /// Kind of the changed object
    pub kind: ObjectKind,
    /// What happened
    pub event_type: EventType,
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
    /// Object labels at the time of the event
    pub labels: BTreeMap<String, String>,
}

impl StoreEvent {
    /// Build an event from object metadata
    pub fn from_meta(kind: ObjectKind, event_type: EventType, meta: &ObjectMeta) -> Self {
        Self {
            kind,
            event_type,
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
        }
    }
}

/// Stream of change notifications
pub type EventStream = BoxStream<'static, Result<StoreEvent, StoreError>>;

/// Typed access to cluster state with optimistic concurrency
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch a StrataCluster; `None` if it does not exist
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StrataCluster>, StoreError>;

    /// List StrataClusters in one namespace, or all namespaces when `None`
    async fn list_clusters(
        &self,
        namespace: Option<String>,
    ) -> Result<Vec<StrataCluster>, StoreError>;

    /// Replace the status of `cluster`
    ///
    /// Fails with `Conflict` unless `cluster`'s resource version is current.
    async fn update_cluster_status(
        &self,
        cluster: &StrataCluster,
        status: &StrataClusterStatus,
    ) -> Result<StrataCluster, StoreError>;

    /// Fetch a managed object; `None` if it does not exist
    async fn get(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedObject>, StoreError>;

    /// List managed objects of one kind matching `selector`
    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ManagedObject>, StoreError>;

    /// Create an object; `AlreadyExists` if the name is taken
    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject, StoreError>;

    /// Replace an object
    ///
    /// The object's resource version is the expected current version;
    /// a mismatch fails with `Conflict`.
    async fn update(&self, object: &ManagedObject) -> Result<ManagedObject, StoreError>;

    /// Delete an object; `NotFound` if it does not exist
    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str)
        -> Result<(), StoreError>;

    /// Subscribe to changes of one kind, optionally scoped to a namespace
    ///
    /// Sub-resource watches only report objects carrying the management label.
    fn watch(&self, kind: ObjectKind, namespace: Option<String>) -> EventStream;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> ::kube::Error {
        ::kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "msg".into(),
            reason: reason.into(),
            code,
        })
    }

    mod classification {
        use super::*;

        #[test]
        fn already_exists_is_distinguished_from_conflict() {
            let err = StoreError::from_kube(ObjectKind::Pod, "p", api_error(409, "AlreadyExists"));
            assert!(err.is_already_exists());

            let err = StoreError::from_kube(ObjectKind::Pod, "p", api_error(409, "Conflict"));
            assert!(err.is_conflict());
        }

        #[test]
        fn not_found_maps_from_404() {
            let err = StoreError::from_kube(ObjectKind::Service, "s", api_error(404, "NotFound"));
            assert!(err.is_not_found());
            assert_eq!(err.to_string(), "Service s not found");
        }

        #[test]
        fn invalid_requests_are_not_retryable() {
            for code in [400, 403, 422] {
                let err = StoreError::from_kube(ObjectKind::Pod, "p", api_error(code, "Invalid"));
                assert!(!err.is_retryable(), "code {code}");
            }
        }

        #[test]
        fn server_errors_are_transient() {
            let err = StoreError::from_kube(ObjectKind::Pod, "p", api_error(503, "ServiceUnavailable"));
            assert!(matches!(err, StoreError::Transient { .. }));
            assert!(err.is_retryable());
        }
    }

    #[test]
    fn managed_object_exposes_labels() {
        let mut labels = BTreeMap::new();
        labels.insert("strata.dev/role".to_string(), "head".to_string());
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("c-g0-head".into()),
                namespace: Some("ml".into()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };
        let obj = ManagedObject::from(pod);
        assert_eq!(obj.kind(), ObjectKind::Pod);
        assert_eq!(obj.name(), "c-g0-head");
        assert_eq!(obj.label("strata.dev/role"), Some("head"));
        assert_eq!(obj.label("missing"), None);
        assert!(obj.as_service().is_none());
    }
}
