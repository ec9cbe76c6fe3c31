//! Periodic full resync that re-enqueues every StrataCluster

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use strata_common::store::StateStore;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::{ObjectKey, WorkQueue};

/// Enqueue every cluster in scope every `interval`, starting immediately
///
/// Level-triggered safety net: heals coalesced or missed watch events.
pub async fn resync_loop(
    store: Arc<dyn StateStore>,
    namespace: Option<String>,
    interval: Duration,
    queue: Arc<WorkQueue<ObjectKey>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if queue.is_shutting_down() {
            return;
        }
        match store.list_clusters(namespace.clone()).await {
            Ok(clusters) => {
                debug!(count = clusters.len(), "Resync");
                for cluster in clusters {
                    queue.add(ObjectKey::new(
                        cluster.namespace().unwrap_or_default(),
                        cluster.name_any(),
                    ));
                }
            }
            Err(e) => warn!(error = %e, "Resync list failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::crd::{ContainerTemplate, StrataCluster, StrataClusterSpec};
    use strata_common::store::MemoryStore;

    fn cluster(namespace: &str, name: &str) -> StrataCluster {
        let mut c = StrataCluster::new(
            name,
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
        c.metadata.namespace = Some(namespace.into());
        c
    }

    #[tokio::test(start_paused = true)]
    async fn resync_enqueues_clusters_in_scope_each_interval() {
        let store = Arc::new(MemoryStore::new());
        store.apply_cluster(cluster("ml", "a"));
        store.apply_cluster(cluster("ml", "b"));
        store.apply_cluster(cluster("other", "c"));
        let queue = Arc::new(WorkQueue::new());

        let task = tokio::spawn(resync_loop(
            store.clone(),
            Some("ml".into()),
            Duration::from_secs(30),
            Arc::clone(&queue),
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.len(), 2);

        for _ in 0..2 {
            let key = queue.get().await.unwrap();
            assert_eq!(key.namespace, "ml");
            queue.done(&key);
        }
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(queue.len(), 2);
        task.abort();
    }
}
