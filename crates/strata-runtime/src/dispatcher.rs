//! Watch event dispatcher
//!
//! The only task that reads watch streams. It maps each event to the owning
//! cluster key and enqueues it; no reconcile logic runs here.

use std::sync::Arc;

use futures::stream::select_all;
use futures::StreamExt;
use strata_common::store::EventStream;
use tracing::{trace, warn};

use crate::{ObjectKey, WorkQueue};

/// Forward events from `streams` into `queue` until every stream ends
pub async fn dispatch(streams: Vec<EventStream>, queue: Arc<WorkQueue<ObjectKey>>) {
    let mut merged = select_all(streams);
    while let Some(item) = merged.next().await {
        match item {
            Ok(event) => match ObjectKey::for_event(&event) {
                Some(key) => {
                    trace!(
                        kind = %event.kind,
                        object = %event.name,
                        cluster = %key,
                        event = ?event.event_type,
                        "Dispatching"
                    );
                    queue.add(key);
                }
                None => trace!(kind = %event.kind, object = %event.name, "No owner, skipping"),
            },
            // Watchers recover on their own; the resync covers anything missed meanwhile
            Err(e) => warn!(error = %e, "Watch stream error"),
        }
    }
    warn!("All watch streams ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::time::Duration;
    use strata_common::crd::{ContainerTemplate, StrataCluster, StrataClusterSpec};
    use strata_common::labels::{cluster_labels, unit_labels, Role};
    use strata_common::store::{ManagedObject, MemoryStore, ObjectKind, StateStore};

    fn pod(name: &str, labels: std::collections::BTreeMap<String, String>) -> ManagedObject {
        ManagedObject::Pod(Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ml".into()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn events_from_all_kinds_enqueue_owning_cluster() {
        let store = MemoryStore::new();
        let queue = Arc::new(WorkQueue::new());
        let streams = vec![
            store.watch(ObjectKind::Cluster, None),
            store.watch(ObjectKind::Pod, None),
        ];
        let task = tokio::spawn(dispatch(streams, Arc::clone(&queue)));

        let mut cluster = StrataCluster::new(
            "train",
            StrataClusterSpec {
                head_template: ContainerTemplate {
                    image: "img:1".into(),
                    ..Default::default()
                },
                worker_groups: vec![],
                upgrade_strategy: None,
                suspend: false,
            },
        );
        cluster.metadata.namespace = Some("ml".into());
        store.apply_cluster(cluster);
        store
            .create(&pod("train-g0-head", unit_labels("train", "train-g0", Role::Head, "head")))
            .await
            .unwrap();
        store
            .create(&pod("serve-g0-head", cluster_labels("serve")))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();

        let mut keys = vec![];
        while !queue.is_empty() {
            let key = queue.get().await.unwrap();
            queue.done(&key);
            keys.push(key.name);
        }
        keys.sort();
        assert_eq!(keys, vec!["serve".to_string(), "train".to_string()]);
    }
}
