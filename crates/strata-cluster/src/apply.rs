//! Store writes for one reconcile pass
//!
//! [`PassWriter`] wraps the store with the idempotence rules every
//! sub-resource operation follows: "already exists" on create and "not
//! found" on delete are successes, failures are logged and tallied instead
//! of aborting the pass, and deletes that must run last are deferred until
//! [`PassWriter::flush_deferred`].

use std::sync::Arc;

use strata_common::store::{ManagedObject, ObjectKind, StateStore, StoreError};
use tracing::{debug, info, warn};

use crate::error::ReconcileError;

/// Result of an optimistic update
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOutcome {
    /// Object already matched; nothing written
    Unchanged,
    /// Object written
    Updated(ManagedObject),
}

/// Re-read, mutate, and write an object until the write lands
///
/// `mutate` returns `None` when the current object already has the desired
/// shape. Conflicts are retried up to `max_conflict_retries` times.
pub async fn update_with_retry<F>(
    store: &dyn StateStore,
    kind: ObjectKind,
    namespace: &str,
    name: &str,
    max_conflict_retries: u32,
    mut mutate: F,
) -> Result<UpdateOutcome, StoreError>
where
    F: FnMut(&ManagedObject) -> Option<ManagedObject>,
{
    let mut attempt = 0u32;
    loop {
        let current = store
            .get(kind, namespace, name)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind,
                name: name.to_string(),
            })?;
        let Some(desired) = mutate(&current) else {
            return Ok(UpdateOutcome::Unchanged);
        };

        let mut desired = desired;
        desired.meta_mut().resource_version = current.resource_version().map(str::to_string);
        match store.update(&desired).await {
            Ok(updated) => return Ok(UpdateOutcome::Updated(updated)),
            Err(e) if e.is_conflict() && attempt < max_conflict_retries => {
                attempt += 1;
                debug!(%kind, name, attempt, "write conflict, re-reading");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Accumulates the outcome of sub-resource writes for one cluster
pub struct PassWriter {
    store: Arc<dyn StateStore>,
    cluster: String,
    namespace: String,
    max_conflict_retries: u32,
    failed: usize,
    first: Option<StoreError>,
    deferred: Vec<(ObjectKind, String)>,
    mutations: usize,
}

impl PassWriter {
    pub fn new(
        store: Arc<dyn StateStore>,
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            cluster: cluster.into(),
            namespace: namespace.into(),
            max_conflict_retries,
            failed: 0,
            first: None,
            deferred: Vec::new(),
            mutations: 0,
        }
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn max_conflict_retries(&self) -> u32 {
        self.max_conflict_retries
    }

    fn record(&mut self, op: &str, kind: ObjectKind, name: &str, err: StoreError) {
        warn!(
            cluster = %self.cluster,
            %kind,
            object = name,
            error = %err,
            "{op} failed"
        );
        self.failed += 1;
        if self.first.is_none() {
            self.first = Some(err);
        }
    }

    /// Create an object; true if this call created it
    pub async fn create(&mut self, object: ManagedObject) -> bool {
        let kind = object.kind();
        let name = object.name().to_string();
        match self.store.create(&object).await {
            Ok(_) => {
                info!(cluster = %self.cluster, %kind, object = %name, "created");
                self.mutations += 1;
                true
            }
            Err(e) if e.is_already_exists() => false,
            Err(e) => {
                self.record("create", kind, &name, e);
                false
            }
        }
    }

    /// Delete an object now; true if this call removed it
    pub async fn delete(&mut self, kind: ObjectKind, name: &str, reason: &str) -> bool {
        match self.store.delete(kind, &self.namespace, name).await {
            Ok(()) => {
                info!(cluster = %self.cluster, %kind, object = name, reason, "deleted");
                self.mutations += 1;
                true
            }
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                self.record("delete", kind, name, e);
                false
            }
        }
    }

    /// Queue a delete to run after every other write of the pass
    pub fn delete_last(&mut self, kind: ObjectKind, name: impl Into<String>) {
        let name = name.into();
        if !self.deferred.iter().any(|(k, n)| *k == kind && *n == name) {
            self.deferred.push((kind, name));
        }
    }

    /// Run queued deletes
    pub async fn flush_deferred(&mut self) {
        for (kind, name) in std::mem::take(&mut self.deferred) {
            self.delete(kind, &name, "replaced").await;
        }
    }

    /// Optimistic update; see [`update_with_retry`]
    pub async fn update<F>(&mut self, kind: ObjectKind, name: &str, mutate: F) -> UpdateOutcome
    where
        F: FnMut(&ManagedObject) -> Option<ManagedObject>,
    {
        let result = update_with_retry(
            self.store.as_ref(),
            kind,
            &self.namespace,
            name,
            self.max_conflict_retries,
            mutate,
        )
        .await;
        match result {
            Ok(UpdateOutcome::Updated(obj)) => {
                info!(cluster = %self.cluster, %kind, object = name, "updated");
                self.mutations += 1;
                UpdateOutcome::Updated(obj)
            }
            Ok(UpdateOutcome::Unchanged) => UpdateOutcome::Unchanged,
            Err(e) => {
                self.record("update", kind, name, e);
                UpdateOutcome::Unchanged
            }
        }
    }

    /// Tally an error from an operation run outside the writer
    pub fn fail(&mut self, op: &str, kind: ObjectKind, name: &str, err: StoreError) {
        self.record(op, kind, name, err);
    }

    /// Writes that landed this pass
    pub fn mutations(&self) -> usize {
        self.mutations
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// Error summarizing every failed operation, if any failed
    pub fn into_error(self) -> Option<ReconcileError> {
        let failed = self.failed;
        let cluster = self.cluster;
        self.first.map(|first| ReconcileError::Partial {
            cluster,
            failed,
            first,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use mockall::predicate::eq;
    use strata_common::store::{FailOp, MemoryStore, MockStateStore};

    fn service(name: &str) -> ManagedObject {
        Service {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ml".into()),
                ..Default::default()
            },
            ..Default::default()
        }
        .into()
    }

    fn conflict() -> StoreError {
        StoreError::Conflict {
            kind: ObjectKind::Service,
            name: "svc".into(),
            message: "stale".into(),
        }
    }

    mod update_with_retry {
        use super::*;

        #[tokio::test]
        async fn unchanged_object_is_not_written() {
            let store = MemoryStore::new();
            store.create(&service("svc")).await.unwrap();
            let writes = store.write_count();

            let outcome = update_with_retry(&store, ObjectKind::Service, "ml", "svc", 3, |_| None)
                .await
                .unwrap();
            assert_eq!(outcome, UpdateOutcome::Unchanged);
            assert_eq!(store.write_count(), writes);
        }

        #[tokio::test]
        async fn conflicts_are_retried_then_succeed() {
            let store = MemoryStore::new();
            store.create(&service("svc")).await.unwrap();
            store.fail_next(FailOp::Update(ObjectKind::Service), conflict());
            store.fail_next(FailOp::Update(ObjectKind::Service), conflict());

            let outcome = update_with_retry(&store, ObjectKind::Service, "ml", "svc", 3, |cur| {
                let mut next = cur.clone();
                next.meta_mut()
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert("k".into(), "v".into());
                Some(next)
            })
            .await
            .unwrap();
            assert!(matches!(outcome, UpdateOutcome::Updated(_)));
            assert_eq!(store.service("ml", "svc").unwrap().metadata.labels.unwrap()["k"], "v");
        }

        #[tokio::test]
        async fn conflicts_past_the_bound_are_returned() {
            let mut store = MockStateStore::new();
            store
                .expect_get()
                .with(eq(ObjectKind::Service), eq("ml"), eq("svc"))
                .times(2)
                .returning(|_, _, _| Ok(Some(service("svc"))));
            store.expect_update().times(2).returning(|_| Err(conflict()));

            let err = update_with_retry(&store, ObjectKind::Service, "ml", "svc", 1, |cur| {
                Some(cur.clone())
            })
            .await
            .unwrap_err();
            assert!(err.is_conflict());
        }

        #[tokio::test]
        async fn missing_object_is_not_found() {
            let store = MemoryStore::new();
            let err = update_with_retry(&store, ObjectKind::Service, "ml", "svc", 3, |c| {
                Some(c.clone())
            })
            .await
            .unwrap_err();
            assert!(err.is_not_found());
        }
    }

    mod pass_writer {
        use super::*;

        #[tokio::test]
        async fn duplicate_create_and_missing_delete_are_successes() {
            let store = Arc::new(MemoryStore::new());
            let mut writer = PassWriter::new(store.clone(), "train", "ml", 3);

            assert!(writer.create(service("svc")).await);
            assert!(!writer.create(service("svc")).await);
            assert!(writer.delete(ObjectKind::Service, "svc", "test").await);
            assert!(!writer.delete(ObjectKind::Service, "svc", "test").await);
            assert!(!writer.has_failures());
            assert_eq!(writer.mutations(), 2);
            assert!(writer.into_error().is_none());
        }

        #[tokio::test]
        async fn failures_are_tallied_without_stopping() {
            let store = Arc::new(MemoryStore::new());
            store.fail_next(
                FailOp::Create(ObjectKind::Service),
                StoreError::Transient {
                    message: "connection reset".into(),
                },
            );
            let mut writer = PassWriter::new(store.clone(), "train", "ml", 3);

            assert!(!writer.create(service("a")).await);
            assert!(writer.create(service("b")).await);

            match writer.into_error() {
                Some(ReconcileError::Partial { failed, first, .. }) => {
                    assert_eq!(failed, 1);
                    assert!(first.is_retryable());
                }
                other => panic!("expected partial failure, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn deferred_deletes_run_once_on_flush() {
            let store = Arc::new(MemoryStore::new());
            store.create(&service("old")).await.unwrap();
            let mut writer = PassWriter::new(store.clone(), "train", "ml", 3);

            writer.delete_last(ObjectKind::Service, "old");
            writer.delete_last(ObjectKind::Service, "old");
            assert!(store.service("ml", "old").is_some());

            writer.flush_deferred().await;
            assert!(store.service("ml", "old").is_none());
            assert_eq!(writer.mutations(), 1);
        }
    }
}
