//! Traffic routing pointer
//!
//! The serving service `<cluster>-serve` selects exactly one generation's
//! head. Switching generations is a single optimistic update of its selector.

use k8s_openapi::api::core::v1::{Service, ServicePort};
use kube::ResourceExt;
use strata_common::crd::{ContainerTemplate, StrataCluster};
use strata_common::store::{ManagedObject, ObjectKind, StateStore, StoreError};
use tracing::info;

use crate::apply::{update_with_retry, UpdateOutcome};
use crate::resources::{render_serving_service, serving_service_name, serving_target};

/// What [`ensure_serving`] did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingOutcome {
    Unchanged,
    Created,
    /// Selector or ports rewritten; `from` is the generation selected before
    Updated { from: Option<String> },
}

fn port_key(ports: Option<&Vec<ServicePort>>) -> Vec<(Option<String>, i32, Option<String>)> {
    ports
        .into_iter()
        .flatten()
        .map(|p| {
            (
                p.name.clone(),
                p.port,
                p.target_port.as_ref().map(|t| format!("{t:?}")),
            )
        })
        .collect()
}

/// Merge the rendered routing fields into the live service
///
/// Server-assigned fields (cluster IP, session affinity, ...) are left alone.
fn merge(current: &Service, desired: &Service) -> Option<Service> {
    let cur_spec = current.spec.clone().unwrap_or_default();
    let want_spec = desired.spec.clone().unwrap_or_default();

    let labels_match = desired
        .labels()
        .iter()
        .all(|(k, v)| current.labels().get(k) == Some(v));
    let selector_match = cur_spec.selector == want_spec.selector;
    let ports_match = port_key(cur_spec.ports.as_ref()) == port_key(want_spec.ports.as_ref());
    if labels_match && selector_match && ports_match {
        return None;
    }

    let mut next = current.clone();
    next.metadata
        .labels
        .get_or_insert_with(Default::default)
        .extend(desired.labels().clone());
    let spec = next.spec.get_or_insert_with(Default::default);
    spec.selector = want_spec.selector;
    spec.ports = want_spec.ports;
    Some(next)
}

/// Point the serving service at `generation`'s head, creating it if absent
pub async fn ensure_serving(
    store: &dyn StateStore,
    cluster: &StrataCluster,
    generation: &str,
    head_template: &ContainerTemplate,
    max_conflict_retries: u32,
) -> Result<RoutingOutcome, StoreError> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = serving_service_name(&cluster.name_any());
    let desired = render_serving_service(cluster, generation, head_template);

    if store.get(ObjectKind::Service, &namespace, &name).await?.is_none() {
        match store.create(&desired.clone().into()).await {
            Ok(_) => {
                info!(cluster = %cluster.name_any(), generation, "serving endpoint created");
                return Ok(RoutingOutcome::Created);
            }
            // Raced with another writer; converge it like any existing endpoint
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
    }

    let outcome = update_serving(store, &namespace, &name, &desired, max_conflict_retries).await?;
    if let RoutingOutcome::Updated { from } = &outcome {
        if from.as_deref() != Some(generation) {
            info!(
                cluster = %cluster.name_any(),
                from = from.as_deref().unwrap_or("<none>"),
                to = generation,
                "traffic switched"
            );
        }
    }
    Ok(outcome)
}

async fn update_serving(
    store: &dyn StateStore,
    namespace: &str,
    name: &str,
    desired: &Service,
    max_conflict_retries: u32,
) -> Result<RoutingOutcome, StoreError> {
    let mut from = None;
    let outcome = update_with_retry(
        store,
        ObjectKind::Service,
        namespace,
        name,
        max_conflict_retries,
        |current| {
            let service = current.as_service()?;
            from = serving_target(service).map(str::to_string);
            merge(service, desired).map(ManagedObject::from)
        },
    )
    .await?;
    Ok(match outcome {
        UpdateOutcome::Unchanged => RoutingOutcome::Unchanged,
        UpdateOutcome::Updated(_) => RoutingOutcome::Updated { from },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::crd::{PortSpec, StrataClusterSpec};
    use strata_common::store::{FailOp, MemoryStore};

    fn cluster() -> StrataCluster {
        let mut c = StrataCluster::new(
            "train",
            StrataClusterSpec {
                head_template: ContainerTemplate {
                    image: "v1".into(),
                    ports: vec![PortSpec {
                        name: "serve".into(),
                        container_port: 8000,
                    }],
                    ..Default::default()
                },
                worker_groups: vec![],
                upgrade_strategy: None,
                suspend: false,
            },
        );
        c.metadata.namespace = Some("ml".into());
        c
    }

    #[tokio::test]
    async fn creates_then_leaves_alone() {
        let store = MemoryStore::new();
        let c = cluster();

        let first = ensure_serving(&store, &c, "train-g0", &c.spec.head_template, 3)
            .await
            .unwrap();
        assert_eq!(first, RoutingOutcome::Created);

        let writes = store.write_count();
        let second = ensure_serving(&store, &c, "train-g0", &c.spec.head_template, 3)
            .await
            .unwrap();
        assert_eq!(second, RoutingOutcome::Unchanged);
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn switch_moves_selector_only() {
        let store = MemoryStore::new();
        let c = cluster();
        ensure_serving(&store, &c, "train-g0", &c.spec.head_template, 3)
            .await
            .unwrap();

        let outcome = ensure_serving(&store, &c, "train-g1", &c.spec.head_template, 3)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RoutingOutcome::Updated {
                from: Some("train-g0".into())
            }
        );
        let svc = store.service("ml", "train-serve").unwrap();
        assert_eq!(serving_target(&svc), Some("train-g1"));
    }

    #[tokio::test]
    async fn failed_switch_leaves_pointer_in_place() {
        let store = MemoryStore::new();
        let c = cluster();
        ensure_serving(&store, &c, "train-g0", &c.spec.head_template, 3)
            .await
            .unwrap();
        store.fail_next(
            FailOp::Update(ObjectKind::Service),
            StoreError::Transient {
                message: "timeout".into(),
            },
        );

        let result = ensure_serving(&store, &c, "train-g1", &c.spec.head_template, 3).await;
        assert!(result.is_err());
        let svc = store.service("ml", "train-serve").unwrap();
        assert_eq!(serving_target(&svc), Some("train-g0"));
    }
}
